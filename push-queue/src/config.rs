//! Runtime configuration.
//!
//! Everything is read once at startup from the process environment (after
//! `.env` is loaded) and passed down explicitly; nothing below `main` reads
//! environment variables on its own except the web push key loader.

use std::time::Duration;

use crate::{Error, Result};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:push-queue.db?mode=rwc";

/// Lease and retry policy of the queue itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a claimed delivery stays exclusive to its worker.
    pub lease_duration: Duration,
    /// Transient failures allowed before a delivery becomes `failed`.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Dequeue worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Best-effort unique id written to `locked_by`.
    pub instance_id: String,
    /// Maximum deliveries leased per claim.
    pub batch_size: usize,
    /// Pause between polls, after both empty and processed batches.
    pub idle_delay: Duration,
    /// First backoff after a storage failure.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_id: fallback_instance_id(None),
            batch_size: 10,
            idle_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Directory for daily rolling log files; console only when unset.
    pub log_dir: Option<String>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut queue = QueueConfig::default();
        if let Some(secs) = parse_number::<u64>(&get, "PUSH_QUEUE_LEASE_SECS")? {
            if secs == 0 {
                return Err(Error::config("PUSH_QUEUE_LEASE_SECS must be greater than 0"));
            }
            queue.lease_duration = Duration::from_secs(secs);
        }
        if let Some(max_retries) = parse_number::<u32>(&get, "PUSH_QUEUE_MAX_RETRIES")? {
            if max_retries == 0 {
                return Err(Error::config("PUSH_QUEUE_MAX_RETRIES must be greater than 0"));
            }
            queue.max_retries = max_retries;
        }

        let mut worker = WorkerConfig {
            instance_id: get("PUSH_QUEUE_INSTANCE_ID")
                .unwrap_or_else(|| fallback_instance_id(get("HOSTNAME").as_deref())),
            ..WorkerConfig::default()
        };
        if let Some(batch_size) = parse_number::<usize>(&get, "PUSH_QUEUE_BATCH_SIZE")? {
            if batch_size == 0 {
                return Err(Error::config("PUSH_QUEUE_BATCH_SIZE must be greater than 0"));
            }
            worker.batch_size = batch_size;
        }
        if let Some(ms) = parse_number::<u64>(&get, "PUSH_QUEUE_IDLE_DELAY_MS")? {
            worker.idle_delay = Duration::from_millis(ms);
        }

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: get("LOG_DIR"),
            queue,
            worker,
        })
    }
}

fn parse_number<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::config(format!("Invalid {}={:?}: {}", key, raw, e)))
        })
        .transpose()
}

/// `host-pid` when a host name is known, otherwise a random id.
pub fn fallback_instance_id(hostname: Option<&str>) -> String {
    match hostname.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => format!("{}-{}", host, std::process::id()),
        None => format!("worker-{}", uuid::Uuid::new_v4()),
    }
}
