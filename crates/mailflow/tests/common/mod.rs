#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mailflow::jobs::retry::{RetryConfig, StorageRetry};
use mailflow::jobs::{
    Job, JobRunner, JobState, JobStore, Lease, ManualClock, MemoryStore, NackOutcome, Scheduler,
    StateCounts, Worker, WorkerConfig,
};
use mailflow::mail::{EmailPayload, Mailer, SendError};
use mailflow::StorageError;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

pub fn email(to: &str) -> Value {
    EmailPayload::new(to, "welcome").to_value()
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub clock: Arc<ManualClock>,
}

pub fn harness_on(store: Arc<dyn JobStore>, max_attempts: i32) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(store, clock.clone()).with_max_attempts(max_attempts);
    Harness { scheduler, clock }
}

pub fn memory_harness(max_attempts: i32) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), max_attempts)
}

pub fn no_jitter() -> RetryConfig {
    RetryConfig {
        base: Duration::from_secs(1),
        max: Duration::from_secs(60),
        jitter_pct: 0.0,
    }
}

pub fn fast_storage_retry(attempts: u32) -> StorageRetry {
    StorageRetry {
        delay: Duration::from_millis(1),
        attempts,
    }
}

pub fn worker_for(scheduler: &Scheduler, mailer: Arc<dyn Mailer>, worker_id: &str) -> Worker {
    let runner = JobRunner::new(scheduler.clone(), mailer, no_jitter())
        .send_timeout(Duration::from_secs(5))
        .storage_retry(fast_storage_retry(3));
    Worker::new(
        scheduler.clone(),
        runner,
        WorkerConfig {
            worker_id: worker_id.to_string(),
            batch_size: 10,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            storage_retry: fast_storage_retry(3),
        },
    )
}

// ----------------------------
// Mailers
// ----------------------------

#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<EmailPayload>>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &EmailPayload) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FailingMailer {
    calls: Arc<AtomicUsize>,
}

impl FailingMailer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _email: &EmailPayload) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SendError::Transport("smtp 421 service not available".into()))
    }
}

pub struct SlowMailer(pub Duration);

#[async_trait]
impl Mailer for SlowMailer {
    async fn send(&self, _email: &EmailPayload) -> Result<(), SendError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

pub struct PanickingMailer;

#[async_trait]
impl Mailer for PanickingMailer {
    async fn send(&self, _email: &EmailPayload) -> Result<(), SendError> {
        panic!("mailer blew up");
    }
}

// ----------------------------
// Store with injectable outages
// ----------------------------

#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: Arc<AtomicBool>,
    lease_failures_left: Arc<AtomicU32>,
}

impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next_leases(&self, n: u32) {
        self.lease_failures_left.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert(&self, job: &Job) -> Result<(), StorageError> {
        self.check()?;
        self.inner.insert(job).await
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        max_count: usize,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        self.check()?;
        let left = self.lease_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.lease_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("injected lease failure".into()));
        }
        self.inner.lease_due(now, worker_id, max_count, lease_expiry).await
    }

    async fn ack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Option<&Lease>,
    ) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.ack(id, now, lease).await
    }

    async fn nack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        error: Option<&str>,
        lease: Option<&Lease>,
    ) -> Result<NackOutcome, StorageError> {
        self.check()?;
        self.inner.nack(id, now, retry_at, error, lease).await
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.cancel(id, now).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StorageError> {
        self.check()?;
        self.inner.list(state, limit).await
    }

    async fn counts(&self) -> Result<StateCounts, StorageError> {
        self.check()?;
        self.inner.counts().await
    }

    async fn replay(&self, source_id: Uuid, replay: &Job) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.replay(source_id, replay).await
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.purge_finished(cutoff, limit).await
    }
}

// ----------------------------
// Postgres
// ----------------------------

/// Connect, migrate and truncate. `None` when TEST_DATABASE_URL is unset.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
