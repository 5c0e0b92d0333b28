use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::clock::{self, Clock, SystemClock};
use super::memory::MemoryStore;
use super::model::{Job, JobState, Lease, NackOutcome, NewJob, StateCounts};
use super::store::JobStore;
use crate::error::StorageError;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const MAX_LIST_LIMIT: usize = 500;

/// The only owner of job state transitions.
///
/// Cheap to clone; every clone shares the same store and clock. Workers and
/// the HTTP layer receive a `Scheduler` explicitly and go through it for
/// every mutation.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Non-durable scheduler on the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    /// Default retry budget for jobs enqueued without an explicit one.
    pub fn with_max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a `Pending` job that becomes due after `delay`.
    pub async fn enqueue(&self, payload: Value, delay: Duration) -> Result<Uuid, StorageError> {
        self.enqueue_job(NewJob::new(payload, delay)).await
    }

    pub async fn enqueue_job(&self, new: NewJob) -> Result<Uuid, StorageError> {
        let now = self.now();
        let job = Job {
            id: Uuid::now_v7(),
            payload: new.payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(self.max_attempts).max(1),
            not_before: clock::add(now, new.delay),
            lease_expiry: None,
            leased_by: None,
            last_error: None,
            replay_of: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        self.store.insert(&job).await?;
        tracing::debug!(job_id = %job.id, not_before = %job.not_before, "job enqueued");
        Ok(job.id)
    }

    /// Lease up to `max_count` due jobs (or abandoned leases) for `lease_duration`.
    ///
    /// Returned jobs are in `(not_before, id)` order and already carry the
    /// incremented `attempts`.
    pub async fn lease_due(
        &self,
        worker_id: &str,
        max_count: usize,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, StorageError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let expiry = clock::add(now, lease_duration);
        self.store.lease_due(now, worker_id, max_count, expiry).await
    }

    /// `Leased -> Done`, whoever holds the lease. Acking anything that is not
    /// leased is a no-op and returns `false`.
    ///
    /// Workers should use [`ack_lease`](Self::ack_lease) instead.
    pub async fn ack(&self, id: Uuid) -> Result<bool, StorageError> {
        self.store.ack(id, self.now(), None).await
    }

    /// `Leased -> Done`, but only while `lease` is still the live lease on the
    /// job. A holder whose lease expired and was taken over gets `false`.
    pub async fn ack_lease(&self, id: Uuid, lease: &Lease) -> Result<bool, StorageError> {
        self.store.ack(id, self.now(), Some(lease)).await
    }

    /// Give a leased job back: retry after `backoff`, or dead-letter it once
    /// its attempts are used up.
    pub async fn nack(&self, id: Uuid, backoff: Duration) -> Result<NackOutcome, StorageError> {
        self.nack_inner(id, backoff, None, None).await
    }

    /// Like [`nack`](Self::nack) but records `error` as the job's `last_error`.
    pub async fn nack_with_error(
        &self,
        id: Uuid,
        backoff: Duration,
        error: &str,
    ) -> Result<NackOutcome, StorageError> {
        self.nack_inner(id, backoff, Some(error), None).await
    }

    /// Nack on behalf of `lease`'s holder. Returns [`NackOutcome::Ignored`]
    /// when the lease is no longer live, leaving the current holder alone.
    pub async fn nack_lease(
        &self,
        id: Uuid,
        lease: &Lease,
        backoff: Duration,
        error: Option<&str>,
    ) -> Result<NackOutcome, StorageError> {
        self.nack_inner(id, backoff, error, Some(lease)).await
    }

    async fn nack_inner(
        &self,
        id: Uuid,
        backoff: Duration,
        error: Option<&str>,
        lease: Option<&Lease>,
    ) -> Result<NackOutcome, StorageError> {
        let now = self.now();
        self.store
            .nack(id, now, clock::add(now, backoff), error, lease)
            .await
    }

    /// `Pending -> Cancelled`. A leased or finished job cannot be cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, StorageError> {
        self.store.cancel(id, self.now()).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        self.store.get(id).await
    }

    pub async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StorageError> {
        self.store
            .list(state, limit.clamp(1, MAX_LIST_LIMIT))
            .await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        self.list(JobState::DeadLettered, limit).await
    }

    pub async fn counts(&self) -> Result<StateCounts, StorageError> {
        self.store.counts().await
    }

    /// Enqueue a fresh, immediately due copy of a dead-lettered job.
    ///
    /// Returns `None` when `id` does not name a dead-lettered job.
    pub async fn replay(&self, id: Uuid) -> Result<Option<Uuid>, StorageError> {
        let Some(source) = self.store.get(id).await? else {
            return Ok(None);
        };
        if source.state != JobState::DeadLettered {
            return Ok(None);
        }

        let now = self.now();
        let replay = Job {
            id: Uuid::now_v7(),
            payload: source.payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: source.max_attempts,
            not_before: now,
            lease_expiry: None,
            leased_by: None,
            last_error: None,
            replay_of: Some(id),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        if self.store.replay(id, &replay).await? {
            tracing::info!(job_id = %replay.id, replay_of = %id, "dead-lettered job replayed");
            Ok(Some(replay.id))
        } else {
            Ok(None)
        }
    }

    /// Delete done and cancelled jobs that finished more than `older_than` ago.
    pub async fn purge_finished(&self, older_than: Duration, limit: usize) -> Result<u64, StorageError> {
        let cutoff = clock::sub(self.now(), older_than);
        self.store.purge_finished(cutoff, limit).await
    }
}
