use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::StorageError;

/// Exponential backoff for failed sends: `base * 2^attempts`, capped, with jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

pub fn next_delay(attempts: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let exp = attempts.max(0) as u32;

    // 2^exp; anything that overflows is far past the cap anyway
    let pow2 = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);

    let delay = cfg.base.saturating_mul(pow2).min(cfg.max);

    if cfg.jitter_pct <= 0.0 {
        return delay;
    }

    // jitter in range [-jitter_pct, +jitter_pct]
    let secs = delay.as_secs_f64();
    let jitter_range = secs * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (secs + jitter).clamp(0.0, cfg.max.as_secs_f64());
    // f64 rounding can land just past what a Duration holds
    Duration::try_from_secs_f64(jittered).unwrap_or(cfg.max)
}

/// Fixed-delay retry for transient storage failures.
#[derive(Debug, Clone)]
pub struct StorageRetry {
    pub delay: Duration,
    /// Total tries, including the first one.
    pub attempts: u32,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            attempts: 3,
        }
    }
}

impl StorageRetry {
    /// Run `op`, retrying storage errors up to `attempts` times in total.
    /// The last error is returned if every try fails.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let tries = self.attempts.max(1);
        let mut try_no = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if try_no < tries => {
                    tracing::warn!(op = what, try_no, error = %e, "storage error, retrying");
                    try_no += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
