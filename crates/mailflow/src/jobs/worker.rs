use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::retry::StorageRetry;
use super::runner::{JobOutcome, JobRunner};
use super::scheduler::Scheduler;
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub batch_size: usize,
    /// Must cover the worst-case send time, or jobs get executed twice.
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub storage_retry: StorageRetry,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            batch_size: 10,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            storage_retry: StorageRetry::default(),
        }
    }
}

/// Totals for one polled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub leased: usize,
    pub sent: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
    /// Jobs whose result could not be reported (storage down, or the send panicked).
    pub abandoned: usize,
}

/// Polls the scheduler for due jobs and runs them.
///
/// Any number of workers may share one scheduler; they coordinate only
/// through its atomic lease.
pub struct Worker {
    scheduler: Scheduler,
    runner: JobRunner,
    cfg: WorkerConfig,
}

impl Worker {
    pub fn new(scheduler: Scheduler, runner: JobRunner, cfg: WorkerConfig) -> Self {
        Self {
            scheduler,
            runner,
            cfg,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.cfg.worker_id
    }

    /// Lease one batch and drive every job in it to ack or nack.
    pub async fn poll_once(&self) -> Result<BatchReport, StorageError> {
        let scheduler = self.scheduler.clone();
        let worker_id = self.cfg.worker_id.clone();
        let (batch_size, lease_duration) = (self.cfg.batch_size, self.cfg.lease_duration);

        let batch = self
            .cfg
            .storage_retry
            .run("lease_due", || {
                let scheduler = scheduler.clone();
                let worker_id = worker_id.clone();
                async move {
                    scheduler
                        .lease_due(&worker_id, batch_size, lease_duration)
                        .await
                }
            })
            .await?;

        let mut report = BatchReport {
            leased: batch.len(),
            ..BatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let mut join_set = JoinSet::new();
        for job in batch {
            let runner = self.runner.clone();
            let worker_id = self.cfg.worker_id.clone();
            join_set.spawn(async move {
                tracing::debug!(%worker_id, job_id = %job.id, attempts = job.attempts, "leased job");
                (job.id, runner.run(&job).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(JobOutcome::Sent))) => report.sent += 1,
                Ok((_, Ok(JobOutcome::Retrying { .. }))) => report.retrying += 1,
                Ok((_, Ok(JobOutcome::DeadLettered))) => report.dead_lettered += 1,
                Ok((_, Ok(JobOutcome::LeaseLost))) => report.lease_lost += 1,
                Ok((job_id, Err(e))) => {
                    report.abandoned += 1;
                    tracing::error!(
                        worker_id = %self.cfg.worker_id,
                        %job_id,
                        error = %e,
                        "could not record job result; job will be retried after lease expiry"
                    );
                }
                Err(e) => {
                    report.abandoned += 1;
                    tracing::error!(worker_id = %self.cfg.worker_id, error = %e, "job task panicked");
                }
            }
        }

        Ok(report)
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Sleeps for `poll_interval` only when there was nothing to do. Storage
    /// errors are logged and polling continues.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.cfg.worker_id,
            batch_size = self.cfg.batch_size,
            lease_ms = self.cfg.lease_duration.as_millis() as u64,
            "worker started"
        );

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(report) if report.leased == 0 => true,
                Ok(report) => {
                    tracing::debug!(worker_id = %self.cfg.worker_id, ?report, "batch finished");
                    false
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.cfg.worker_id, error = %e, "lease failed after retries");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.cfg.worker_id, "worker stopped");
    }
}
