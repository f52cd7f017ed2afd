use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use timbel_config::Config;
use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Decides whether a failed attempt may be retried. Receives the error and
/// the number of attempts made so far.
pub type RetryCondition = Arc<dyn Fn(&TimbelError, u32) -> bool + Send + Sync>;
/// Called before each retry with the error, attempts so far and the retry budget.
pub type OnRetry = Arc<dyn Fn(&TimbelError, u32, u32) + Send + Sync>;
/// Called once the retry budget is spent, with the last error and attempts made.
pub type OnFailure = Arc<dyn Fn(&TimbelError, u32) + Send + Sync>;

const NETWORK_ERROR_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ENOTFOUND",
    "ETIMEDOUT",
    "TIMEOUT",
    "NETWORK_ERROR",
    "SERVER_ERROR",
];

const TRANSIENT_MESSAGES: &[&str] = &[
    "timeout",
    "connection reset",
    "connection refused",
    "network error",
    "temporary failure",
];

const DATABASE_ERROR_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    // PostgreSQL: connection failure, admin shutdown, cannot connect now, too many connections
    "08000",
    "08001",
    "08006",
    "57P01",
    "57P03",
    "53300",
];

const DATABASE_MESSAGES: &[&str] = &[
    "connection terminated",
    "connection refused",
    "connection reset",
    "connection lost",
    "server closed the connection",
    "could not connect",
    "too many connections",
    "the database system is starting up",
    "the database system is shutting down",
    "timeout",
];

const API_ERROR_CODES: &[&str] = &["ECONNRESET", "ECONNREFUSED", "ENOTFOUND", "ETIMEDOUT", "NETWORK_ERROR"];

fn code_in(error: &TimbelError, codes: &[&str]) -> bool {
    error.code().is_some_and(|code| codes.contains(&code))
}

fn message_contains_any(error: &TimbelError, fragments: &[&str]) -> bool {
    let message = error.to_string().to_lowercase();
    fragments.iter().any(|f| message.contains(f))
}

/// Default retry predicate: 5xx/429 statuses, network error codes and
/// transient-sounding messages.
pub fn is_retryable(error: &TimbelError) -> bool {
    if let Some(status) = error.status() {
        if (500..600).contains(&status) || status == 429 {
            return true;
        }
    }
    code_in(error, NETWORK_ERROR_CODES) || message_contains_any(error, TRANSIENT_MESSAGES)
}

/// Retry predicate for database calls: connection loss and availability errors.
pub fn is_retryable_database(error: &TimbelError) -> bool {
    code_in(error, DATABASE_ERROR_CODES) || message_contains_any(error, DATABASE_MESSAGES)
}

/// Retry predicate for outbound API calls.
pub fn is_retryable_api(error: &TimbelError) -> bool {
    if let Some(status) = error.status() {
        if status == 429 || (500..600).contains(&status) {
            return true;
        }
    }
    code_in(error, API_ERROR_CODES)
}

/// Configuration for retry behavior.
#[derive(Clone)]
pub struct RetryConfig {
    pub name: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Randomize each delay by up to +/-10%.
    pub jitter: bool,
    /// `None` uses [`is_retryable`].
    pub retry_condition: Option<RetryCondition>,
    pub on_retry: Option<OnRetry>,
    pub on_failure: Option<OnFailure>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "operation".to_string(),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            retry_condition: None,
            on_retry: None,
            on_failure: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("jitter", &self.jitter)
            .field("retry_condition", &self.retry_condition.is_some())
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    pub fn from_settings(config: &Config, name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_retries: config.retry_max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            exponential_base: config.retry_exponential_base,
            jitter: config.retry_jitter,
            ..Default::default()
        }
    }

    pub fn with_condition(
        mut self,
        condition: impl Fn(&TimbelError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_on_retry(mut self, callback: impl Fn(&TimbelError, u32, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn with_on_failure(mut self, callback: impl Fn(&TimbelError, u32) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffMode {
    Standard,
    /// Widen the delay for 429 responses.
    RateLimitAware,
}

/// Cumulative retry counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    /// Every invocation of the wrapped function.
    pub total_attempts: u64,
    /// Executions that eventually succeeded.
    pub successful_attempts: u64,
    /// Executions that gave up.
    pub failed_attempts: u64,
    pub retries_performed: u64,
    pub average_retries: f64,
}

/// Bounded retries with exponential backoff and jitter.
pub struct RetryHandler {
    config: RetryConfig,
    condition: RetryCondition,
    mode: BackoffMode,
    stats: Mutex<RetryStats>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        let condition: RetryCondition = match config.retry_condition.clone() {
            Some(condition) => condition,
            None => Arc::new(|e: &TimbelError, _attempt: u32| is_retryable(e)),
        };
        Self {
            config,
            condition,
            mode: BackoffMode::Standard,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Handler for database calls; an explicit `retry_condition` still wins.
    pub fn database(mut config: RetryConfig) -> Self {
        if config.retry_condition.is_none() {
            config.retry_condition = Some(Arc::new(|e: &TimbelError, _attempt: u32| {
                is_retryable_database(e)
            }));
        }
        Self::new(config)
    }

    /// Handler for outbound API calls, honoring `Retry-After` on 429.
    pub fn api(mut config: RetryConfig) -> Self {
        if config.retry_condition.is_none() {
            config.retry_condition = Some(Arc::new(|e: &TimbelError, _attempt: u32| {
                is_retryable_api(e)
            }));
        }
        Self {
            mode: BackoffMode::RateLimitAware,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `f` until it succeeds, the error is not retryable, or the
    /// retry budget is spent.
    pub async fn execute<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            self.stats.lock().await.total_attempts += 1;

            let err = match f().await {
                Ok(result) => {
                    self.record_success(attempt).await;
                    if attempt > 0 {
                        info!(operation = %self.config.name, retries = attempt, "Operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.config.max_retries || !(self.condition)(&err, attempt) {
                return Err(self.exhausted(err, attempt, started.elapsed()).await);
            }

            self.notify_retry(&err, attempt);
            let delay = self.delay_for(&err, attempt - 1);
            warn!(
                operation = %self.config.name,
                attempt,
                max_attempts = self.config.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Backoff for the given retry index (0 = first retry).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.config.max_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay_ms = (base_ms * self.config.exponential_base.powi(exponent)).min(max_ms);

        if self.config.jitter {
            let spread = delay_ms * 0.1;
            delay_ms += rand::thread_rng().gen_range(-spread..=spread);
        }

        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    /// Backoff for a specific failure, widening rate-limited responses when
    /// this is an API handler.
    pub fn delay_for(&self, error: &TimbelError, attempt: u32) -> Duration {
        let delay = self.calculate_delay(attempt);
        if self.mode != BackoffMode::RateLimitAware || error.status() != Some(429) {
            return delay;
        }

        match error.retry_after().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(secs) => Duration::from_secs(secs).min(self.config.max_delay),
            None => delay * 2,
        }
    }

    fn notify_retry(&self, error: &TimbelError, attempt: u32) {
        if let Some(on_retry) = &self.config.on_retry {
            if catch_unwind(AssertUnwindSafe(|| on_retry(error, attempt, self.config.max_retries))).is_err() {
                warn!(operation = %self.config.name, "on_retry callback panicked");
            }
        }
    }

    async fn record_success(&self, retries: u32) {
        let mut stats = self.stats.lock().await;
        stats.successful_attempts += 1;
        if retries > 0 {
            stats.retries_performed += u64::from(retries);
        }
        stats.average_retries = stats.retries_performed as f64 / stats.successful_attempts as f64;
    }

    async fn exhausted(&self, err: TimbelError, attempts: u32, elapsed: Duration) -> TimbelError {
        self.stats.lock().await.failed_attempts += 1;

        if let Some(on_failure) = &self.config.on_failure {
            if catch_unwind(AssertUnwindSafe(|| on_failure(&err, attempts))).is_err() {
                warn!(operation = %self.config.name, "on_failure callback panicked");
            }
        }

        error!(
            operation = %self.config.name,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %err,
            "Operation failed after retries"
        );

        TimbelError::RetryExhausted {
            name: self.config.name.clone(),
            attempts,
            max_retries: self.config.max_retries,
            elapsed,
            source: Box::new(err),
        }
    }

    pub async fn get_stats(&self) -> RetryStats {
        self.stats.lock().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = RetryStats::default();
    }
}

/// Execute an async function with exponential backoff retry.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, name: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let config = RetryConfig {
        name: name.to_string(),
        ..config.clone()
    };
    RetryHandler::new(config).execute(f).await
}
