//! Runtime configuration loaded from environment variables.
//!
//! Every value has a default; unparsable or out-of-range values fall back to
//! it with a warning so a typo never prevents the relay from starting.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tracing::warn;

use crate::error::PipelineError;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_URL: &str = "sqlite:alert-relay.db?mode=rwc";

/// Default dedup window: 15 minutes.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 900;

/// Default number of tasks drained per dequeue call.
pub const DEFAULT_DEQUEUE_BATCH: usize = 50;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_COLLABORATOR_TIMEOUT_MS: u64 = 2000;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dedup queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long an admitted `(alert_id, recipient_id)` suppresses repeats.
    pub dedup_ttl: chrono::Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: chrono::Duration::seconds(DEFAULT_DEDUP_TTL_SECS as i64),
        }
    }
}

/// What the dispatch worker does with queued tasks on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Dispatch everything still queued, then stop.
    Drain,
    /// Stop immediately and leave queued tasks behind.
    Abandon,
}

impl FromStr for ShutdownPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownPolicy::Drain),
            "abandon" => Ok(ShutdownPolicy::Abandon),
            other => Err(PipelineError::Config(format!(
                "unknown shutdown policy '{}'",
                other
            ))),
        }
    }
}

/// Dispatch consumer loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub cleanup_interval: Duration,
    pub shutdown_policy: ShutdownPolicy,
    /// Failed dispatch attempts allowed per task before it is marked failed.
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_DEQUEUE_BATCH,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            shutdown_policy: ShutdownPolicy::Drain,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Alert analyzer settings.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Upper bound on each collaborator call.
    pub collaborator_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_millis(DEFAULT_COLLABORATOR_TIMEOUT_MS),
        }
    }
}

/// Priority calculator settings.
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Offset used to derive local hour and weekday for the time-of-day factor.
    pub local_offset: FixedOffset,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            local_offset: utc(),
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Top-level configuration for the relay binary.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub database_url: String,
    /// Optional HTTP gateway that receives dispatched batches.
    pub dispatch_url: Option<String>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub analyzer: AnalyzerConfig,
    pub priority: PriorityConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            dispatch_url: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            analyzer: AnalyzerConfig::default(),
            priority: PriorityConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `ALERT_RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();

        let port = parse_or(&lookup, "ALERT_RELAY_PORT", DEFAULT_PORT);
        let database_url =
            lookup("ALERT_RELAY_DATABASE_URL").unwrap_or_else(|| DEFAULT_DB_URL.to_string());
        let dispatch_url = lookup("ALERT_RELAY_DISPATCH_URL").filter(|url| !url.is_empty());

        let ttl_secs = positive_or(
            &lookup,
            "ALERT_RELAY_DEDUP_TTL_SECS",
            DEFAULT_DEDUP_TTL_SECS,
        );
        let batch_size = positive_or(
            &lookup,
            "ALERT_RELAY_DEQUEUE_BATCH",
            DEFAULT_DEQUEUE_BATCH as u64,
        ) as usize;
        let poll_ms = positive_or(
            &lookup,
            "ALERT_RELAY_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        );
        let cleanup_secs = positive_or(
            &lookup,
            "ALERT_RELAY_CLEANUP_INTERVAL_SECS",
            DEFAULT_CLEANUP_INTERVAL_SECS,
        );
        let timeout_ms = positive_or(
            &lookup,
            "ALERT_RELAY_COLLABORATOR_TIMEOUT_MS",
            DEFAULT_COLLABORATOR_TIMEOUT_MS,
        );
        let max_retries = parse_or(&lookup, "ALERT_RELAY_MAX_RETRIES", DEFAULT_MAX_RETRIES);
        let shutdown_policy = parse_or(
            &lookup,
            "ALERT_RELAY_SHUTDOWN_POLICY",
            defaults.worker.shutdown_policy,
        );

        let offset_minutes: i32 = parse_or(&lookup, "ALERT_RELAY_UTC_OFFSET_MINUTES", 0);
        let local_offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| {
            warn!(offset_minutes, "UTC offset out of range, using UTC");
            utc()
        });

        Self {
            port,
            database_url,
            dispatch_url,
            queue: QueueConfig {
                dedup_ttl: chrono::Duration::seconds(ttl_secs as i64),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(poll_ms),
                batch_size,
                cleanup_interval: Duration::from_secs(cleanup_secs),
                shutdown_policy,
                max_retries,
            },
            analyzer: AnalyzerConfig {
                collaborator_timeout: Duration::from_millis(timeout_ms),
            },
            priority: PriorityConfig { local_offset },
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "Invalid configuration value, using default");
            default
        }),
        None => default,
    }
}

fn positive_or<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default);
    if value == 0 {
        warn!(key, "Configuration value must be positive, using default");
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RelayConfig::from_lookup(|_| None);

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database_url, DEFAULT_DB_URL);
        assert!(config.dispatch_url.is_none());
        assert_eq!(config.queue.dedup_ttl, chrono::Duration::minutes(15));
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.worker.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.priority.local_offset.local_minus_utc(), 0);
    }

    #[test]
    fn test_values_from_lookup() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("ALERT_RELAY_PORT", "8080"),
            ("ALERT_RELAY_DEDUP_TTL_SECS", "60"),
            ("ALERT_RELAY_DEQUEUE_BATCH", "10"),
            ("ALERT_RELAY_UTC_OFFSET_MINUTES", "480"),
            ("ALERT_RELAY_SHUTDOWN_POLICY", "abandon"),
            ("ALERT_RELAY_MAX_RETRIES", "0"),
            ("ALERT_RELAY_DISPATCH_URL", "http://gateway.local/notify"),
        ]));

        assert_eq!(config.port, 8080);
        assert_eq!(config.queue.dedup_ttl, chrono::Duration::seconds(60));
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.priority.local_offset.local_minus_utc(), 8 * 3600);
        assert_eq!(config.worker.shutdown_policy, ShutdownPolicy::Abandon);
        assert_eq!(config.worker.max_retries, 0);
        assert_eq!(
            config.dispatch_url.as_deref(),
            Some("http://gateway.local/notify")
        );
    }

    #[test]
    fn test_unknown_shutdown_policy() {
        let err = "linger".parse::<ShutdownPolicy>().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!("DRAIN".parse::<ShutdownPolicy>().unwrap(), ShutdownPolicy::Drain);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("ALERT_RELAY_PORT", "not-a-port"),
            ("ALERT_RELAY_DEDUP_TTL_SECS", "0"),
            ("ALERT_RELAY_UTC_OFFSET_MINUTES", "99999"),
            ("ALERT_RELAY_DISPATCH_URL", ""),
        ]));

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.queue.dedup_ttl, chrono::Duration::minutes(15));
        assert_eq!(config.priority.local_offset.local_minus_utc(), 0);
        assert!(config.dispatch_url.is_none());
    }
}
