use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::model::{Job, Lease, NackOutcome};
use super::retry::{next_delay, RetryConfig, StorageRetry};
use super::scheduler::Scheduler;
use crate::error::StorageError;
use crate::mail::{EmailPayload, Mailer, SendError};

/// What happened to one leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    Retrying { not_before: DateTime<Utc> },
    DeadLettered,
    /// The job was no longer leased when we reported back, e.g. the lease
    /// expired mid-send and another worker took it.
    LeaseLost,
}

/// Executes a leased job against the mailer and reports the result to the scheduler.
#[derive(Clone)]
pub struct JobRunner {
    scheduler: Scheduler,
    mailer: Arc<dyn Mailer>,
    retry_cfg: RetryConfig,
    storage_retry: StorageRetry,
    send_timeout: Option<Duration>,
}

impl JobRunner {
    pub fn new(scheduler: Scheduler, mailer: Arc<dyn Mailer>, retry_cfg: RetryConfig) -> Self {
        Self {
            scheduler,
            mailer,
            retry_cfg,
            storage_retry: StorageRetry::default(),
            send_timeout: None,
        }
    }

    pub fn send_timeout(mut self, dur: Duration) -> Self {
        self.send_timeout = Some(dur);
        self
    }

    pub fn storage_retry(mut self, policy: StorageRetry) -> Self {
        self.storage_retry = policy;
        self
    }

    /// Send the job's email, then ack on success or nack with backoff on failure.
    ///
    /// Send failures never surface here; only a scheduler that stays
    /// unreachable through the storage retry budget yields an error, in which
    /// case the lease expires and the job is picked up again.
    pub async fn run(&self, job: &Job) -> Result<JobOutcome, StorageError> {
        let Some(lease) = job.lease() else {
            tracing::warn!(job_id = %job.id, state = %job.state, "job is not leased; not sending");
            return Ok(JobOutcome::LeaseLost);
        };

        let start = Instant::now();
        let result = self.send(job).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => self.on_success(job, &lease, latency_ms).await,
            Err(err) => self.on_failure(job, &lease, latency_ms, &err).await,
        }
    }

    async fn send(&self, job: &Job) -> Result<(), SendError> {
        let email = EmailPayload::from_value(&job.payload)?;
        let fut = self.mailer.send(&email);
        match self.send_timeout {
            Some(dur) => tokio::time::timeout(dur, fut)
                .await
                .map_err(|_| SendError::Timeout(dur))?,
            None => fut.await,
        }
    }

    async fn on_success(
        &self,
        job: &Job,
        lease: &Lease,
        latency_ms: u64,
    ) -> Result<JobOutcome, StorageError> {
        let scheduler = self.scheduler.clone();
        let id = job.id;
        let acked = self
            .storage_retry
            .run("ack", || {
                let scheduler = scheduler.clone();
                let lease = lease.clone();
                async move { scheduler.ack_lease(id, &lease).await }
            })
            .await?;

        if acked {
            tracing::info!(job_id = %job.id, attempts = job.attempts, latency_ms, "job done");
            Ok(JobOutcome::Sent)
        } else {
            tracing::warn!(job_id = %job.id, attempts = job.attempts, "sent, but lease was lost before ack");
            Ok(JobOutcome::LeaseLost)
        }
    }

    async fn on_failure(
        &self,
        job: &Job,
        lease: &Lease,
        latency_ms: u64,
        err: &SendError,
    ) -> Result<JobOutcome, StorageError> {
        let backoff = {
            let mut rng = StdRng::from_entropy();
            next_delay(job.attempts, &self.retry_cfg, &mut rng)
        };
        let message = err.to_string();

        let scheduler = self.scheduler.clone();
        let id = job.id;
        let outcome = self
            .storage_retry
            .run("nack", || {
                let scheduler = scheduler.clone();
                let lease = lease.clone();
                let message = message.clone();
                async move {
                    scheduler
                        .nack_lease(id, &lease, backoff, Some(&message))
                        .await
                }
            })
            .await?;

        Ok(match outcome {
            NackOutcome::Rescheduled { not_before } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    latency_ms,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "send failed, retry scheduled"
                );
                JobOutcome::Retrying { not_before }
            }
            NackOutcome::DeadLettered => {
                tracing::error!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "send failed, retries exhausted; job dead-lettered"
                );
                JobOutcome::DeadLettered
            }
            NackOutcome::Ignored => {
                tracing::warn!(job_id = %job.id, error = %err, "send failed, but lease was lost before nack");
                JobOutcome::LeaseLost
            }
        })
    }
}
