use std::path::PathBuf;

use timbel_types::{Result, TimbelError};
use tracing::debug;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Paths
    pub base_dir: PathBuf,
    pub dlq_persist_path: PathBuf,

    // Logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_structured: bool,

    // Dead letter queues
    pub dlq_max_retries: u32,
    pub dlq_retry_delay_ms: u64,
    pub dlq_max_queue_size: usize,
    pub dlq_auto_process: bool,

    // Circuit breakers
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_ms: u64,
    pub breaker_monitoring_period_ms: u64,

    // Retry
    pub retry_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_exponential_base: f64,
    pub retry_jitter: bool,

    // Fallback
    pub fallback_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let base_dir = env_or("BASE_DIR", || {
            std::env::current_dir()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });
        let base = PathBuf::from(&base_dir);

        let config = Config {
            base_dir: base.clone(),
            dlq_persist_path: env_path_or("DLQ_PERSIST_PATH", || base.join("data").join("dlq")),

            log_level: env_or("LOG_LEVEL", || "info".to_string()),
            log_file: env_opt("LOG_FILE").map(PathBuf::from),
            log_structured: env_bool("LOG_STRUCTURED", false),

            dlq_max_retries: env_u32("DLQ_MAX_RETRIES", 5),
            dlq_retry_delay_ms: env_u64("DLQ_RETRY_DELAY_MS", 60_000),
            dlq_max_queue_size: env_usize("DLQ_MAX_QUEUE_SIZE", 10_000),
            dlq_auto_process: env_bool("DLQ_AUTO_PROCESS", true),

            breaker_failure_threshold: env_u32("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_reset_timeout_ms: env_u64("BREAKER_RESET_TIMEOUT_MS", 60_000),
            breaker_monitoring_period_ms: env_u64("BREAKER_MONITORING_PERIOD_MS", 10_000),

            retry_max_retries: env_u32("RETRY_MAX_RETRIES", 3),
            retry_base_delay_ms: env_u64("RETRY_BASE_DELAY_MS", 1000),
            retry_max_delay_ms: env_u64("RETRY_MAX_DELAY_MS", 30_000),
            retry_exponential_base: env_f64("RETRY_EXPONENTIAL_BASE", 2.0),
            retry_jitter: env_bool("RETRY_JITTER", true),

            fallback_timeout_ms: env_u64("FALLBACK_TIMEOUT_MS", 5000),
        };

        config.validate()?;
        debug!(base_dir = %config.base_dir.display(), "Configuration loaded");
        Ok(config)
    }

    /// Reject values that would make the resilience primitives misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.breaker_failure_threshold == 0 {
            return Err(TimbelError::Config(
                "BREAKER_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.dlq_max_queue_size == 0 {
            return Err(TimbelError::Config(
                "DLQ_MAX_QUEUE_SIZE must be at least 1".to_string(),
            ));
        }
        if self.retry_exponential_base < 1.0 {
            return Err(TimbelError::Config(format!(
                "RETRY_EXPONENTIAL_BASE must be >= 1.0, got {}",
                self.retry_exponential_base
            )));
        }
        Ok(())
    }

    /// Create required directories.
    pub fn create_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dlq_persist_path).map_err(|e| {
            TimbelError::Config(format!(
                "Failed to create directory {}: {e}",
                self.dlq_persist_path.display()
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path_or(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default)
}
