use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{Job, JobState, Lease, NackOutcome, StateCounts};
use crate::error::StorageError;

/// Persistence behind the [`Scheduler`](super::Scheduler).
///
/// Every method is one atomic operation on the store. Timestamps are passed
/// in by the scheduler so all backends agree on a single clock. Transitions
/// are guarded on the current state: a call that finds the job in any other
/// state changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, job: &Job) -> Result<(), StorageError>;

    /// Select up to `max_count` leasable jobs ordered by `(not_before, id)`,
    /// mark them `Leased` until `lease_expiry`, and bump `attempts`.
    ///
    /// Must be atomic against concurrent callers: a job is returned to at
    /// most one of them per lease.
    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        max_count: usize,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError>;

    /// `Leased -> Done`. Returns whether the transition happened.
    ///
    /// With `lease` set, only that exact lease may finish the job; a holder
    /// whose lease was taken over gets `false`.
    async fn ack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Option<&Lease>,
    ) -> Result<bool, StorageError>;

    /// `Leased -> Pending(retry_at)` while attempts remain, else `Leased -> DeadLettered`.
    /// Guarded by `lease` the same way as [`ack`](Self::ack).
    async fn nack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        error: Option<&str>,
        lease: Option<&Lease>,
    ) -> Result<NackOutcome, StorageError>;

    /// `Pending -> Cancelled`.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    /// Jobs in `state`, most recently updated first.
    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StorageError>;

    async fn counts(&self) -> Result<StateCounts, StorageError>;

    /// Insert `replay` as a fresh pending copy of the dead-lettered job `source_id`.
    /// Returns `false` (and inserts nothing) unless the source is dead-lettered.
    async fn replay(&self, source_id: Uuid, replay: &Job) -> Result<bool, StorageError>;

    /// Delete up to `limit` done/cancelled jobs finished before `cutoff`.
    async fn purge_finished(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64, StorageError>;
}
