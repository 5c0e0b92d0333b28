// crates/mailflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{Job, JobState, Lease, NackOutcome, StateCounts};
use super::store::JobStore;
use crate::error::StorageError;

/// Postgres-backed [`JobStore`].
///
/// Leasing is one `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
/// statement, so two workers can never claim the same row.
#[derive(Clone)]
pub struct PgJobsRepo {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload_json: Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    not_before: DateTime<Utc>,
    lease_expiry: Option<DateTime<Utc>>,
    leased_by: Option<String>,
    last_error: Option<String>,
    replay_of_job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::parse(&row.state).ok_or_else(|| StorageError::Corrupt {
            id: row.id,
            reason: format!("unknown state {:?}", row.state),
        })?;

        Ok(Job {
            id: row.id,
            payload: row.payload_json,
            state,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            not_before: row.not_before,
            lease_expiry: row.lease_expiry,
            leased_by: row.leased_by,
            last_error: row.last_error,
            replay_of: row.replay_of_job_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StorageError> {
    rows.into_iter().map(Job::try_from).collect()
}

fn clamp_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl PgJobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobsRepo {
    async fn insert(&self, job: &Job) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, payload_json, state, attempts, max_attempts,
                not_before, lease_expiry, leased_by, last_error, replay_of_job_id,
                created_at, updated_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.not_before)
        .bind(job.lease_expiry)
        .bind(job.leased_by.as_deref())
        .bind(job.last_error.as_deref())
        .bind(job.replay_of)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        max_count: usize,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Vec<Job>, StorageError> {
        // Row locks taken by the candidate scan are held until the UPDATE
        // commits; concurrent callers skip them instead of waiting.
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH candidates AS (
                SELECT id
                FROM jobs
                WHERE (state = 'pending' AND not_before <= $1)
                   OR (state = 'leased' AND lease_expiry < $1)
                ORDER BY not_before ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET state = 'leased',
                attempts = j.attempts + 1,
                lease_expiry = $3,
                leased_by = $4,
                updated_at = $1
            FROM candidates c
            WHERE j.id = c.id
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(clamp_limit(max_count))
        .bind(lease_expiry)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        let mut jobs = into_jobs(rows)?;
        jobs.sort_by(|a, b| (a.not_before, a.id).cmp(&(b.not_before, b.id)));
        Ok(jobs)
    }

    async fn ack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Option<&Lease>,
    ) -> Result<bool, StorageError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'done',
                lease_expiry = NULL,
                updated_at = $2,
                finished_at = $2
            WHERE id = $1
              AND state = 'leased'
              AND ($3::text IS NULL OR (leased_by = $3 AND attempts = $4))
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(lease.map(|l| l.worker_id.as_str()))
        .bind(lease.map(|l| l.attempt))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn nack(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        error: Option<&str>,
        lease: Option<&Lease>,
    ) -> Result<NackOutcome, StorageError> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'dead_lettered' END,
                not_before = CASE WHEN attempts < max_attempts THEN $3 ELSE not_before END,
                finished_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $2 END,
                lease_expiry = NULL,
                leased_by = NULL,
                last_error = COALESCE($4, last_error),
                updated_at = $2
            WHERE id = $1
              AND state = 'leased'
              AND ($5::text IS NULL OR (leased_by = $5 AND attempts = $6))
            RETURNING state
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(retry_at)
        .bind(error)
        .bind(lease.map(|l| l.worker_id.as_str()))
        .bind(lease.map(|l| l.attempt))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match state.as_deref() {
            None => NackOutcome::Ignored,
            Some("pending") => NackOutcome::Rescheduled {
                not_before: retry_at,
            },
            Some("dead_lettered") => NackOutcome::DeadLettered,
            Some(other) => {
                return Err(StorageError::Corrupt {
                    id,
                    reason: format!("nack produced state {other:?}"),
                })
            }
        })
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled',
                updated_at = $2,
                finished_at = $2
            WHERE id = $1
              AND state = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StorageError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE state = $1
            ORDER BY updated_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn counts(&self) -> Result<StateCounts, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            match JobState::parse(&state) {
                Some(st) => counts.add(st, n),
                None => tracing::warn!(%state, n, "ignoring unknown job state in counts"),
            }
        }
        Ok(counts)
    }

    async fn replay(&self, source_id: Uuid, replay: &Job) -> Result<bool, StorageError> {
        // payload and budget are copied from the source row inside the same statement
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, payload_json, state, attempts, max_attempts,
                not_before, replay_of_job_id, created_at, updated_at
            )
            SELECT $2, src.payload_json, 'pending', 0, src.max_attempts,
                   $3, src.id, $4, $4
            FROM jobs src
            WHERE src.id = $1
              AND src.state = 'dead_lettered'
            "#,
        )
        .bind(source_id)
        .bind(replay.id)
        .bind(replay.not_before)
        .bind(replay.created_at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64, StorageError> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE state IN ('done', 'cancelled')
                  AND finished_at < $1
                ORDER BY finished_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(cutoff)
        .bind(clamp_limit(limit))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
