use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{Job, JobState, Lease, NackOutcome, StateCounts};
use super::store::JobStore;
use crate::error::StorageError;

/// In-process [`JobStore`].
///
/// Jobs live in a map behind one async mutex, so each operation (including
/// the select-and-update of `lease_due`) is a single critical section. Not
/// durable: everything is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<BTreeMap<Uuid, Job>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

fn holds(job: &Job, lease: Option<&Lease>) -> bool {
    match lease {
        Some(lease) => job.is_held_by(lease),
        None => job.state == JobState::Leased,
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        max_count: usize,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| j.is_leasable(now))
            .map(|j| (j.not_before, j.id))
            .collect();
        due.sort_unstable();
        due.truncate(max_count);

        let mut leased = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Leased;
                job.attempts += 1;
                job.lease_expiry = Some(lease_expiry);
                job.leased_by = Some(worker_id.to_string());
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn ack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Option<&Lease>,
    ) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if holds(job, lease) => {
                job.state = JobState::Done;
                job.lease_expiry = None;
                job.updated_at = now;
                job.finished_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn nack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        error: Option<&str>,
        lease: Option<&Lease>,
    ) -> Result<NackOutcome, StorageError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id).filter(|j| holds(j, lease)) else {
            return Ok(NackOutcome::Ignored);
        };

        job.lease_expiry = None;
        job.leased_by = None;
        job.updated_at = now;
        if let Some(e) = error {
            job.last_error = Some(e.to_string());
        }

        if job.retries_exhausted() {
            job.state = JobState::DeadLettered;
            job.finished_at = Some(now);
            Ok(NackOutcome::DeadLettered)
        } else {
            job.state = JobState::Pending;
            job.not_before = retry_at;
            Ok(NackOutcome::Rescheduled {
                not_before: retry_at,
            })
        }
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Cancelled;
                job.updated_at = now;
                job.finished_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs.values().filter(|j| j.state == state).cloned().collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn counts(&self) -> Result<StateCounts, StorageError> {
        let jobs = self.jobs.lock().await;
        let mut counts = StateCounts::default();
        for job in jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn replay(&self, source_id: Uuid, replay: &Job) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.lock().await;
        let is_dead = jobs
            .get(&source_id)
            .is_some_and(|j| j.state == JobState::DeadLettered);
        if !is_dead {
            return Ok(false);
        }
        jobs.insert(replay.id, replay.clone());
        Ok(true)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64, StorageError> {
        let mut jobs = self.jobs.lock().await;
        let mut doomed: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Done | JobState::Cancelled))
            .filter_map(|j| j.finished_at.filter(|f| *f < cutoff).map(|f| (f, j.id)))
            .collect();
        // oldest first, like the Postgres store
        doomed.sort_unstable();
        doomed.truncate(limit);
        for (_, id) in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
