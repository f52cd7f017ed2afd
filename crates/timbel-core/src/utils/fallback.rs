use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use timbel_config::Config;
use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::retry::{RetryConfig, RetryHandler};

type OperationFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Configuration for [`FallbackHandler`].
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Deadline for the retry-wrapped primary operation.
    pub timeout: Duration,
    /// Abort the primary when it loses the race. By default it keeps
    /// running detached and its result is discarded.
    pub cancel_on_timeout: bool,
    pub retry: RetryConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            cancel_on_timeout: false,
            retry: RetryConfig::default(),
        }
    }
}

impl FallbackConfig {
    pub fn from_settings(config: &Config, name: &str) -> Self {
        Self {
            timeout: Duration::from_millis(config.fallback_timeout_ms),
            cancel_on_timeout: false,
            retry: RetryConfig::from_settings(config, name),
        }
    }
}

/// Result of a [`FallbackHandler`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub fallback_used: bool,
    /// Primary failure that caused the fallback.
    pub fallback_reason: Option<String>,
}

impl<T> FallbackOutcome<T> {
    fn primary(value: T) -> Self {
        Self {
            value,
            fallback_used: false,
            fallback_reason: None,
        }
    }

    fn fallback(value: T, reason: String) -> Self {
        Self {
            value,
            fallback_used: true,
            fallback_reason: Some(reason),
        }
    }
}

impl FallbackOutcome<Value> {
    /// Fold the outcome into the value: JSON objects produced by the
    /// fallback gain `_fallbackUsed` and `_fallbackReason` keys.
    pub fn into_tagged(self) -> Value {
        let mut value = self.value;
        if self.fallback_used {
            if let Value::Object(map) = &mut value {
                map.insert("_fallbackUsed".to_string(), Value::Bool(true));
                map.insert(
                    "_fallbackReason".to_string(),
                    Value::String(self.fallback_reason.unwrap_or_default()),
                );
            }
        }
        value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStats {
    pub total_calls: u64,
    pub primary_success: u64,
    pub fallback_used: u64,
    pub total_failures: u64,
}

/// Races a retry-wrapped primary operation against a timeout and answers
/// from a fallback operation when the primary fails or is too slow.
pub struct FallbackHandler<A, T> {
    primary: OperationFn<A, T>,
    fallback: OperationFn<A, T>,
    timeout: Duration,
    cancel_on_timeout: bool,
    retry: Arc<RetryHandler>,
    stats: Mutex<FallbackStats>,
}

impl<A, T> FallbackHandler<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new<P, PFut, B, BFut>(primary: P, fallback: B, config: FallbackConfig) -> Self
    where
        P: Fn(A) -> PFut + Send + Sync + 'static,
        PFut: Future<Output = Result<T>> + Send + 'static,
        B: Fn(A) -> BFut + Send + Sync + 'static,
        BFut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            primary: Arc::new(move |args| primary(args).boxed()),
            fallback: Arc::new(move |args| fallback(args).boxed()),
            timeout: config.timeout,
            cancel_on_timeout: config.cancel_on_timeout,
            retry: Arc::new(RetryHandler::new(config.retry)),
            stats: Mutex::new(FallbackStats::default()),
        }
    }

    pub async fn execute(&self, args: A) -> Result<FallbackOutcome<T>> {
        self.stats.lock().await.total_calls += 1;

        let retry = Arc::clone(&self.retry);
        let primary = Arc::clone(&self.primary);
        let primary_args = args.clone();
        let mut task = tokio::spawn(async move {
            retry.execute(move || primary(primary_args.clone())).await
        });

        let primary_error = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(value))) => {
                self.stats.lock().await.primary_success += 1;
                return Ok(FallbackOutcome::primary(value));
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(join_error)) => TimbelError::Other(format!("Primary operation aborted: {join_error}")),
            Err(_) => {
                if self.cancel_on_timeout {
                    task.abort();
                } else {
                    debug!("Primary operation left running after timeout");
                }
                TimbelError::Timeout(self.timeout)
            }
        };

        warn!(error = %primary_error, "Primary operation failed, using fallback");

        match (self.fallback)(args).await {
            Ok(value) => {
                self.stats.lock().await.fallback_used += 1;
                Ok(FallbackOutcome::fallback(value, primary_error.to_string()))
            }
            Err(fallback_error) => {
                self.stats.lock().await.total_failures += 1;
                Err(TimbelError::FallbackExhausted {
                    primary: Box::new(primary_error),
                    fallback: Box::new(fallback_error),
                })
            }
        }
    }

    pub async fn get_stats(&self) -> FallbackStats {
        self.stats.lock().await.clone()
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use timbel_types::OperationError;

    fn no_retry(timeout_ms: u64) -> FallbackConfig {
        FallbackConfig {
            timeout: Duration::from_millis(timeout_ms),
            cancel_on_timeout: false,
            retry: RetryConfig {
                max_retries: 0,
                jitter: false,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let handler = FallbackHandler::new(
            |n: u32| async move { Ok(n * 2) },
            |_n: u32| async { Ok(0) },
            no_retry(1000),
        );

        let outcome = handler.execute(21).await.unwrap();
        assert_eq!(outcome, FallbackOutcome::primary(42));
        assert_eq!(handler.get_stats().await.primary_success, 1);
    }

    #[tokio::test]
    async fn failing_primary_uses_fallback_once() {
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let calls = Arc::clone(&fallback_calls);
        let handler = FallbackHandler::new(
            |_: ()| async { Err(OperationError::new("db down").with_status(500).into()) },
            move |_: ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(serde_json::json!({ "rows": [] })) }
            },
            no_retry(1000),
        );

        let tagged = handler.execute(()).await.unwrap().into_tagged();

        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tagged["_fallbackUsed"], true);
        assert!(tagged["_fallbackReason"].as_str().unwrap().contains("db down"));
        assert_eq!(handler.get_stats().await.fallback_used, 1);
    }

    #[tokio::test]
    async fn slow_primary_times_out_to_fallback() {
        let handler = FallbackHandler::new(
            |_: ()| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("primary")
            },
            |_: ()| async { Ok("fallback") },
            no_retry(50),
        );

        let started = std::time::Instant::now();
        let outcome = handler.execute(()).await.unwrap();

        assert_eq!(outcome.value, "fallback");
        assert!(outcome.fallback_used);
        assert!(outcome.fallback_reason.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn timed_out_primary_keeps_running_unless_cancelled() {
        for (cancel, expected) in [(false, 1), (true, 0)] {
            let finished = Arc::new(AtomicU32::new(0));
            let done = Arc::clone(&finished);
            let mut config = no_retry(20);
            config.cancel_on_timeout = cancel;
            let handler = FallbackHandler::new(
                move |_: ()| {
                    let done = Arc::clone(&done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    }
                },
                |_: ()| async { Ok(2) },
                config,
            );

            assert_eq!(handler.execute(()).await.unwrap().value, 2);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(finished.load(Ordering::SeqCst), expected, "cancel_on_timeout = {cancel}");
        }
    }

    #[tokio::test]
    async fn both_failing_reports_both_errors() {
        let handler = FallbackHandler::new(
            |_: ()| async { Err::<(), _>(OperationError::new("primary broke").into()) },
            |_: ()| async { Err(OperationError::new("cache empty").into()) },
            no_retry(1000),
        );

        let err = handler.execute(()).await.unwrap_err();
        assert_eq!(err.code(), Some("FALLBACK_EXHAUSTED"));
        let message = err.to_string();
        assert!(message.contains("primary broke"));
        assert!(message.contains("cache empty"));
        assert_eq!(handler.get_stats().await.total_failures, 1);
    }

    #[test]
    fn tagging_leaves_scalars_alone() {
        let outcome = FallbackOutcome::fallback(Value::from(7), "x".to_string());
        assert_eq!(outcome.into_tagged(), Value::from(7));
    }
}
