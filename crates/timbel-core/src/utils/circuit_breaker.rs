use std::any::{type_name, Any};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use timbel_config::Config;
use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::{BusEvent, EventBus};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow through.
    Closed,
    /// Requests are short-circuited.
    Open,
    /// Trial state probing whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Health classification reported in [`CircuitSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Unhealthy,
}

/// Classifies errors that are a normal outcome of the wrapped call.
///
/// Matching errors never count toward the failure threshold.
#[derive(Debug, Clone)]
pub enum ErrorMatcher {
    /// Substring of the error message.
    Message(String),
    /// Regular expression tested against the error message.
    Pattern(Regex),
    /// Exact error code or error name.
    Code(String),
}

impl ErrorMatcher {
    pub fn message(fragment: impl Into<String>) -> Self {
        Self::Message(fragment.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| TimbelError::Config(format!("Invalid expected-error pattern: {e}")))
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self::Code(code.into())
    }

    pub fn matches(&self, error: &TimbelError) -> bool {
        match self {
            Self::Message(fragment) => error.to_string().contains(fragment.as_str()),
            Self::Pattern(re) => re.is_match(&error.to_string()),
            Self::Code(code) => {
                error.code() == Some(code.as_str()) || error.name() == Some(code.as_str())
            }
        }
    }
}

/// Breaker-level fallback. The value is type-erased and handed back to
/// calls whose result type matches it.
pub type FallbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn Any + Send>>> + Send + Sync>;

/// Configuration for a circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Failures (while CLOSED) needed to trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays OPEN before a HALF_OPEN trial.
    pub reset_timeout: Duration,
    pub monitoring_period: Duration,
    pub expected_errors: Vec<ErrorMatcher>,
    pub fallback: Option<FallbackFn>,
    /// Run calls through this breaker one at a time.
    pub serialize_calls: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(10),
            expected_errors: Vec::new(),
            fallback: None,
            serialize_calls: false,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("monitoring_period", &self.monitoring_period)
            .field("expected_errors", &self.expected_errors)
            .field("fallback", &self.fallback.is_some())
            .field("serialize_calls", &self.serialize_calls)
            .finish()
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(config: &Config, name: &str) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.breaker_failure_threshold,
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            monitoring_period: Duration::from_millis(config.breaker_monitoring_period_ms),
            ..Default::default()
        }
    }

    pub fn with_fallback<F, Fut, V>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
        V: Send + 'static,
    {
        self.fallback = Some(Arc::new(move || {
            let pending = fallback();
            Box::pin(async move { pending.await.map(|v| Box::new(v) as Box<dyn Any + Send>) })
        }));
        self
    }
}

/// Cumulative request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub circuit_open_time: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub next_attempt: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub stats: CircuitStats,
    pub health_status: HealthStatus,
}

/// Events published by a breaker.
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    StateChange {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    Success {
        name: String,
        duration: Duration,
    },
    Failure {
        name: String,
        error: String,
        duration: Duration,
        expected: bool,
    },
    ForceReset {
        name: String,
    },
    StatsReset {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitEventKind {
    StateChange,
    Success,
    Failure,
    ForceReset,
    StatsReset,
}

impl BusEvent for CircuitEvent {
    type Kind = CircuitEventKind;

    fn kind(&self) -> CircuitEventKind {
        match self {
            Self::StateChange { .. } => CircuitEventKind::StateChange,
            Self::Success { .. } => CircuitEventKind::Success,
            Self::Failure { .. } => CircuitEventKind::Failure,
            Self::ForceReset { .. } => CircuitEventKind::ForceReset,
            Self::StatsReset { .. } => CircuitEventKind::StatsReset,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: DateTime<Utc>,
    stats: CircuitStats,
}

enum Admission {
    Allow,
    Reject(DateTime<Utc>),
}

/// Circuit breaker guarding one named dependency.
///
/// Counters are updated in short critical sections between awaits; the
/// wrapped call itself runs unlocked, so concurrent calls may interleave
/// their transitions unless `serialize_calls` is set.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    serial: Mutex<()>,
    events: EventBus<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt: Utc::now(),
                stats: CircuitStats::default(),
            }),
            serial: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    /// Whether a call issued now would reach the wrapped function.
    pub async fn is_available(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state != CircuitState::Open || Utc::now() >= inner.next_attempt
    }

    /// Subscribe to breaker events.
    pub fn on(&self, kind: CircuitEventKind, listener: impl Fn(&CircuitEvent) + Send + Sync + 'static) {
        self.events.on(kind, listener);
    }

    /// Execute a function with circuit breaker protection.
    ///
    /// While OPEN, the configured fallback (if any) answers instead. A
    /// fallback whose value is not a `T` fails the call with a `Config` error.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: 'static,
    {
        let fallback = self.config.fallback.clone().map(|fallback| {
            let name = self.config.name.clone();
            move || async move {
                let value = fallback().await?;
                value.downcast::<T>().map(|v| *v).map_err(|_| {
                    TimbelError::Config(format!(
                        "Fallback of circuit breaker {name} does not produce {}",
                        type_name::<T>()
                    ))
                })
            }
        });
        self.run(f, fallback).await
    }

    /// Execute with a per-call fallback used while the circuit is OPEN.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(&self, f: F, fallback: G) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        self.run(f, Some(fallback)).await
    }

    async fn run<T, F, Fut, G, GFut>(&self, f: F, fallback: Option<G>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        let _serial = if self.config.serialize_calls {
            Some(self.serial.lock().await)
        } else {
            None
        };

        let mut events = Vec::new();
        let admission = {
            let mut inner = self.inner.lock().await;
            inner.stats.total_requests += 1;
            if inner.state == CircuitState::Open {
                if Utc::now() < inner.next_attempt {
                    Admission::Reject(inner.next_attempt)
                } else {
                    info!(breaker = %self.config.name, "Circuit breaker entering HALF_OPEN state");
                    events.extend(self.transition(&mut inner, CircuitState::HalfOpen));
                    Admission::Allow
                }
            } else {
                Admission::Allow
            }
        };
        self.publish(&events);

        if let Admission::Reject(next_attempt) = admission {
            if let Some(fallback) = fallback {
                debug!(breaker = %self.config.name, "Circuit OPEN, using fallback");
                return fallback().await;
            }
            self.inner.lock().await.stats.failed_requests += 1;
            return Err(TimbelError::CircuitOpen {
                name: self.config.name.clone(),
                next_attempt,
            });
        }

        let started = Instant::now();
        match f().await {
            Ok(result) => {
                self.on_success(started.elapsed()).await;
                Ok(result)
            }
            Err(e) => {
                // A downstream breaker being open is not this dependency failing.
                if e.code() != Some(TimbelError::CIRCUIT_OPEN) {
                    self.on_failure(&e, started.elapsed()).await;
                }
                Err(e)
            }
        }
    }

    async fn on_success(&self, duration: Duration) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.stats.successful_requests += 1;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.half_open_successes() {
                        info!(breaker = %self.config.name, "Circuit breaker closing after successful trial");
                        events.extend(self.reset_inner(&mut inner));
                    }
                }
                CircuitState::Closed => {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                }
                CircuitState::Open => {}
            }
        }
        events.push(CircuitEvent::Success {
            name: self.config.name.clone(),
            duration,
        });
        self.publish(&events);
    }

    async fn on_failure(&self, error: &TimbelError, duration: Duration) {
        let expected = self.is_expected(error);
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.stats.failed_requests += 1;
            if error.is_timeout() {
                inner.stats.timeouts += 1;
            }

            if !expected {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Utc::now());

                match inner.state {
                    CircuitState::HalfOpen => {
                        warn!(breaker = %self.config.name, error = %error, "Circuit breaker re-opened, trial call failed");
                        events.extend(self.trip_inner(&mut inner));
                    }
                    CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                        warn!(
                            breaker = %self.config.name,
                            failures = inner.failure_count,
                            "Circuit breaker opening after repeated failures"
                        );
                        events.extend(self.trip_inner(&mut inner));
                    }
                    _ => {}
                }
            } else {
                debug!(breaker = %self.config.name, error = %error, "Expected error, not counted");
            }
        }
        events.push(CircuitEvent::Failure {
            name: self.config.name.clone(),
            error: error.to_string(),
            duration,
            expected,
        });
        self.publish(&events);
    }

    fn is_expected(&self, error: &TimbelError) -> bool {
        self.config.expected_errors.iter().any(|m| m.matches(error))
    }

    /// Successes needed in HALF_OPEN before closing: ceil(threshold / 2).
    fn half_open_successes(&self) -> u32 {
        self.config.failure_threshold.div_ceil(2)
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) -> Option<CircuitEvent> {
        let from = inner.state;
        inner.state = to;
        (from != to).then(|| CircuitEvent::StateChange {
            name: self.config.name.clone(),
            from,
            to,
        })
    }

    fn trip_inner(&self, inner: &mut CircuitInner) -> Option<CircuitEvent> {
        let now = Utc::now();
        inner.next_attempt = now + chrono_duration(self.config.reset_timeout);
        inner.success_count = 0;
        inner.stats.circuit_open_time = Some(now);
        self.transition(inner, CircuitState::Open)
    }

    fn reset_inner(&self, inner: &mut CircuitInner) -> Option<CircuitEvent> {
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.stats.last_reset = Some(Utc::now());
        self.transition(inner, CircuitState::Closed)
    }

    fn publish(&self, events: &[CircuitEvent]) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Open the circuit now.
    pub async fn trip(&self) {
        let event = self.trip_inner(&mut *self.inner.lock().await);
        self.publish(event.as_slice());
    }

    /// Close the circuit and clear failure tracking.
    pub async fn reset(&self) {
        let event = self.reset_inner(&mut *self.inner.lock().await);
        self.publish(event.as_slice());
    }

    /// Administrative reset, announced with a `ForceReset` event.
    pub async fn force_reset(&self) {
        self.reset().await;
        info!(breaker = %self.config.name, "Circuit breaker force reset");
        self.publish(&[CircuitEvent::ForceReset {
            name: self.config.name.clone(),
        }]);
    }

    /// Zero the cumulative counters; state is untouched.
    pub async fn reset_stats(&self) {
        self.inner.lock().await.stats = CircuitStats::default();
        self.publish(&[CircuitEvent::StatsReset {
            name: self.config.name.clone(),
        }]);
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.lock().await.stats.clone()
    }

    /// Snapshot including the computed health status.
    pub async fn get_state(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        let health_status = if inner.state == CircuitState::Open {
            HealthStatus::Unhealthy
        } else {
            health_from_stats(&inner.stats)
        };
        CircuitSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            monitoring_period_ms: self.config.monitoring_period.as_millis() as u64,
            next_attempt: (inner.state == CircuitState::Open).then_some(inner.next_attempt),
            last_failure_time: inner.last_failure_time,
            stats: inner.stats.clone(),
            health_status,
        }
    }
}

fn health_from_stats(stats: &CircuitStats) -> HealthStatus {
    if stats.total_requests == 0 {
        return HealthStatus::Healthy;
    }
    let failure_rate = stats.failed_requests as f64 / stats.total_requests as f64;
    if failure_rate > 0.5 {
        HealthStatus::Degraded
    } else if failure_rate > 0.2 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
