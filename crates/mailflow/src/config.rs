use std::time::Duration;

use crate::telemetry::LogFormat;

/// Runtime configuration for the mailflow service.
///
/// Loaded from `MAILFLOW_*` environment variables, with the un-prefixed
/// name accepted as a fallback for the common keys.
#[derive(Clone, Debug)]
pub struct Config {
    /// Postgres URL. When absent the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub worker_id: String,
    pub http_addr: Option<String>,

    pub batch_size: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,

    pub max_attempts: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_jitter_pct: f64,
    pub send_timeout: Duration,

    pub storage_retry_delay: Duration,
    pub storage_retry_attempts: u32,

    pub email_delay: Duration,
    pub default_to: String,
    pub default_template: String,

    pub migrate_on_startup: bool,
    pub purge_after: Duration,
    pub maintenance_interval: Duration,

    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. `from_env` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, fallback: &str| -> Option<String> {
            lookup(primary)
                .filter(|s| !s.trim().is_empty())
                .or_else(|| lookup(fallback).filter(|s| !s.trim().is_empty()))
        };

        let database_url = get("MAILFLOW_DATABASE_URL", "DATABASE_URL");

        let worker_id = get("MAILFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| lookup("HOSTNAME").filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| "worker-1".to_string());

        let http_addr = get("MAILFLOW_HTTP_ADDR", "HTTP_ADDR").and_then(|s| normalize_optional_addr(&s));

        let batch_size: usize = parse_or(get("MAILFLOW_BATCH_SIZE", "BATCH_SIZE"), "BATCH_SIZE", 10)?;
        let lease_seconds: u64 =
            parse_or(get("MAILFLOW_LEASE_SECONDS", "LEASE_SECONDS"), "LEASE_SECONDS", 30)?;
        let poll_interval_ms: u64 = parse_or(
            get("MAILFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS"),
            "POLL_INTERVAL_MS",
            250,
        )?;

        let max_attempts: i32 =
            parse_or(get("MAILFLOW_MAX_ATTEMPTS", "MAX_ATTEMPTS"), "MAX_ATTEMPTS", 3)?;
        let retry_base_ms: u64 =
            parse_or(get("MAILFLOW_RETRY_BASE_MS", "RETRY_BASE_MS"), "RETRY_BASE_MS", 1000)?;
        let retry_max_secs: u64 =
            parse_or(get("MAILFLOW_RETRY_MAX_SECS", "RETRY_MAX_SECS"), "RETRY_MAX_SECS", 15 * 60)?;
        let retry_jitter_pct: f64 = parse_or(
            get("MAILFLOW_RETRY_JITTER_PCT", "RETRY_JITTER_PCT"),
            "RETRY_JITTER_PCT",
            0.20,
        )?;
        let send_timeout_ms: u64 = parse_or(
            get("MAILFLOW_SEND_TIMEOUT_MS", "SEND_TIMEOUT_MS"),
            "SEND_TIMEOUT_MS",
            10_000,
        )?;

        let storage_retry_delay_ms: u64 = parse_or(
            get("MAILFLOW_STORAGE_RETRY_DELAY_MS", "STORAGE_RETRY_DELAY_MS"),
            "STORAGE_RETRY_DELAY_MS",
            500,
        )?;
        let storage_retry_attempts: u32 = parse_or(
            get("MAILFLOW_STORAGE_RETRY_ATTEMPTS", "STORAGE_RETRY_ATTEMPTS"),
            "STORAGE_RETRY_ATTEMPTS",
            3,
        )?;

        let email_delay_ms: u64 =
            parse_or(get("MAILFLOW_EMAIL_DELAY_MS", "EMAIL_DELAY_MS"), "EMAIL_DELAY_MS", 1000)?;
        let default_to = get("MAILFLOW_DEFAULT_TO", "DEFAULT_TO")
            .unwrap_or_else(|| "noreply@example.com".to_string());
        let default_template = get("MAILFLOW_DEFAULT_TEMPLATE", "DEFAULT_TEMPLATE")
            .unwrap_or_else(|| "welcome".to_string());

        let migrate_on_startup = get("MAILFLOW_MIGRATE_ON_STARTUP", "MIGRATE_ON_STARTUP")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let purge_after_hours: u64 = parse_or(
            get("MAILFLOW_PURGE_AFTER_HOURS", "PURGE_AFTER_HOURS"),
            "PURGE_AFTER_HOURS",
            7 * 24,
        )?;
        let purge_after_secs = purge_after_hours
            .checked_mul(3600)
            .ok_or_else(|| anyhow::anyhow!("PURGE_AFTER_HOURS is too large: {purge_after_hours}"))?;
        let maintenance_interval_secs: u64 = parse_or(
            get("MAILFLOW_MAINTENANCE_INTERVAL_SECS", "MAINTENANCE_INTERVAL_SECS"),
            "MAINTENANCE_INTERVAL_SECS",
            60,
        )?;

        let log_format = match get("MAILFLOW_LOG_FORMAT", "LOG_FORMAT") {
            Some(v) => LogFormat::parse(&v)
                .ok_or_else(|| anyhow::anyhow!("LOG_FORMAT must be `pretty` or `json`, got {v:?}"))?,
            None => LogFormat::default(),
        };

        let cfg = Self {
            database_url,
            worker_id,
            http_addr,
            batch_size,
            lease_duration: Duration::from_secs(lease_seconds),
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_attempts,
            retry_base: Duration::from_millis(retry_base_ms),
            retry_max: Duration::from_secs(retry_max_secs),
            retry_jitter_pct,
            send_timeout: Duration::from_millis(send_timeout_ms),
            storage_retry_delay: Duration::from_millis(storage_retry_delay_ms),
            storage_retry_attempts,
            email_delay: Duration::from_millis(email_delay_ms),
            default_to,
            default_template,
            migrate_on_startup,
            purge_after: Duration::from_secs(purge_after_secs),
            maintenance_interval: Duration::from_secs(maintenance_interval_secs),
            log_format,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be > 0");
        }
        if self.max_attempts <= 0 {
            anyhow::bail!("MAX_ATTEMPTS must be > 0");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_pct) {
            anyhow::bail!("RETRY_JITTER_PCT must be within [0, 1]");
        }
        if self.retry_max > MAX_RETRY_MAX {
            anyhow::bail!(
                "RETRY_MAX_SECS must be at most {}s",
                MAX_RETRY_MAX.as_secs()
            );
        }
        if self.retry_base > self.retry_max {
            anyhow::bail!("RETRY_BASE_MS must not exceed RETRY_MAX_SECS");
        }
        // a lease shorter than a send would let a second worker pick the job up mid-send
        if self.lease_duration <= self.send_timeout {
            anyhow::bail!(
                "LEASE_SECONDS ({}s) must exceed SEND_TIMEOUT_MS ({}ms)",
                self.lease_duration.as_secs(),
                self.send_timeout.as_millis()
            );
        }
        Ok(())
    }
}

/// Upper bound for the backoff cap (30 days).
const MAX_RETRY_MAX: Duration = Duration::from_secs(30 * 24 * 3600);

fn parse_or<T: std::str::FromStr>(raw: Option<String>, name: &str, default: T) -> anyhow::Result<T> {
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {v:?}")),
        None => Ok(default),
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = cfg_from(&[]).unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.worker_id, "worker-1");
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.lease_duration, Duration::from_secs(30));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.email_delay, Duration::from_secs(1));
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn prefixed_key_wins_over_fallback() {
        let cfg = cfg_from(&[
            ("MAILFLOW_WORKER_ID", "primary"),
            ("WORKER_ID", "fallback"),
            ("MAX_ATTEMPTS", "7"),
        ])
        .unwrap();
        assert_eq!(cfg.worker_id, "primary");
        assert_eq!(cfg.max_attempts, 7);
    }

    #[test]
    fn http_addr_can_be_switched_off() {
        let cfg = cfg_from(&[("HTTP_ADDR", "off")]).unwrap();
        assert!(cfg.http_addr.is_none());

        let cfg = cfg_from(&[("HTTP_ADDR", "127.0.0.1:8080")]).unwrap();
        assert_eq!(cfg.http_addr.as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn lease_must_outlast_send_timeout() {
        let err = cfg_from(&[("LEASE_SECONDS", "5"), ("SEND_TIMEOUT_MS", "5000")]).unwrap_err();
        assert!(err.to_string().contains("must exceed"), "{err}");
    }

    #[test]
    fn oversized_durations_are_errors_not_panics() {
        let err = cfg_from(&[("PURGE_AFTER_HOURS", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("PURGE_AFTER_HOURS"), "{err}");

        let err = cfg_from(&[("RETRY_MAX_SECS", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("RETRY_MAX_SECS"), "{err}");

        let cfg = cfg_from(&[("PURGE_AFTER_HOURS", "48")]).unwrap();
        assert_eq!(cfg.purge_after, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = cfg_from(&[("BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"), "{err}");

        assert!(cfg_from(&[("MAX_ATTEMPTS", "0")]).is_err());
        assert!(cfg_from(&[("LOG_FORMAT", "xml")]).is_err());
    }
}
