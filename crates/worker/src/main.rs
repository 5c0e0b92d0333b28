use mailflow::api::{self, ApiState, EmailDefaults};
use mailflow::config::Config;
use mailflow::db;
use mailflow::jobs::retry::{RetryConfig, StorageRetry};
use mailflow::jobs::{
    JobRunner, JobStore, MemoryStore, PgJobsRepo, Scheduler, SystemClock, Worker, WorkerConfig,
};
use mailflow::mail::LogMailer;
use mailflow::telemetry;

use std::sync::Arc;
use tokio::sync::watch;

const PURGE_BATCH: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init(cfg.log_format);

    tracing::info!(
        worker_id = %cfg.worker_id,
        store = if cfg.database_url.is_some() { "postgres" } else { "memory" },
        http = cfg.http_addr.as_deref().unwrap_or("disabled"),
        batch_size = cfg.batch_size,
        lease_secs = cfg.lease_duration.as_secs(),
        max_attempts = cfg.max_attempts,
        email_delay_ms = cfg.email_delay.as_millis() as u64,
        "mailflow starting"
    );

    let store: Arc<dyn JobStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(PgJobsRepo::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory job store (jobs are not durable)");
            Arc::new(MemoryStore::new())
        }
    };

    let scheduler = Scheduler::new(store, Arc::new(SystemClock)).with_max_attempts(cfg.max_attempts);

    let storage_retry = StorageRetry {
        delay: cfg.storage_retry_delay,
        attempts: cfg.storage_retry_attempts,
    };
    let runner = JobRunner::new(
        scheduler.clone(),
        Arc::new(LogMailer),
        RetryConfig {
            base: cfg.retry_base,
            max: cfg.retry_max,
            jitter_pct: cfg.retry_jitter_pct,
        },
    )
    .send_timeout(cfg.send_timeout)
    .storage_retry(storage_retry.clone());

    let worker = Worker::new(
        scheduler.clone(),
        runner,
        WorkerConfig {
            worker_id: cfg.worker_id.clone(),
            batch_size: cfg.batch_size,
            lease_duration: cfg.lease_duration,
            poll_interval: cfg.poll_interval,
            storage_retry,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- API task ----
    let api_state = ApiState {
        scheduler: scheduler.clone(),
        email: EmailDefaults {
            delay: cfg.email_delay,
            to: cfg.default_to.clone(),
            template: cfg.default_template.clone(),
        },
    };
    let app = api::router(api_state);
    let listener = match &cfg.http_addr {
        Some(addr) => Some(tokio::net::TcpListener::bind(addr).await?),
        None => None,
    };
    let api_shutdown = shutdown_rx.clone();

    let api_handle = tokio::spawn(async move {
        if let Some(listener) = listener {
            let addr = listener.local_addr()?;
            tracing::info!(%addr, "http api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(stopped(api_shutdown))
                .await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Maintenance task ----
    let maintenance_handle = {
        let scheduler = scheduler.clone();
        let purge_after = cfg.purge_after;
        let interval = cfg.maintenance_interval;
        let stop = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                match scheduler.purge_finished(purge_after, PURGE_BATCH).await {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "purged finished jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "purge failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped(stop.clone()) => break,
                }
            }
        })
    };

    // ---- Worker loop task ----
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; finishing in-flight jobs");
    let _ = shutdown_tx.send(true);

    let (api_res, maintenance_res, worker_res) =
        tokio::join!(api_handle, maintenance_handle, worker_handle);
    api_res??;
    maintenance_res?;
    worker_res?;

    tracing::info!("mailflow stopped");
    Ok(())
}

/// Resolves once shutdown has been requested or the sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
