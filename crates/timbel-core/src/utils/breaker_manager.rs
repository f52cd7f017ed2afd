use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitEventKind, CircuitSnapshot,
    CircuitState,
};

/// Aggregate view across every registered breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_breakers: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub state_changes: u64,
    pub failure_events: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

struct EventCounters {
    state_changes: AtomicU64,
    failure_events: AtomicU64,
    /// Set whenever a breaker or the registry changed after the last snapshot.
    dirty: AtomicBool,
}

impl EventCounters {
    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// Named registry of circuit breakers.
pub struct CircuitBreakerManager {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    counters: Arc<EventCounters>,
    global: Mutex<GlobalStats>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            counters: Arc::new(EventCounters {
                state_changes: AtomicU64::new(0),
                failure_events: AtomicU64::new(0),
                dirty: AtomicBool::new(true),
            }),
            global: Mutex::new(GlobalStats::default()),
            monitor: std::sync::Mutex::new(None),
        }
    }

    /// Create a breaker, or return the one already registered under `name`.
    pub async fn create(&self, name: &str, mut config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        if let Some(existing) = breakers.get(name) {
            warn!(breaker = %name, "Circuit breaker already exists, returning existing instance");
            return Arc::clone(existing);
        }

        config.name = name.to_string();
        let breaker = Arc::new(CircuitBreaker::new(config));

        let counters = Arc::clone(&self.counters);
        breaker.on(CircuitEventKind::StateChange, move |event| {
            counters.state_changes.fetch_add(1, Ordering::Relaxed);
            counters.touch();
            if let CircuitEvent::StateChange { name, from, to } = event {
                info!(breaker = %name, %from, %to, "Circuit breaker state changed");
            }
        });
        let counters = Arc::clone(&self.counters);
        breaker.on(CircuitEventKind::Failure, move |_| {
            counters.failure_events.fetch_add(1, Ordering::Relaxed);
            counters.touch();
        });
        for kind in [
            CircuitEventKind::Success,
            CircuitEventKind::ForceReset,
            CircuitEventKind::StatsReset,
        ] {
            let counters = Arc::clone(&self.counters);
            breaker.on(kind, move |_| counters.touch());
        }

        breakers.insert(name.to_string(), Arc::clone(&breaker));
        self.counters.touch();
        info!(breaker = %name, "Circuit breaker registered");
        breaker
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.lock().await.remove(name).is_some();
        if removed {
            self.counters.touch();
            info!(breaker = %name, "Circuit breaker removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.breakers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.lock().await.is_empty()
    }

    fn registered(breakers: &HashMap<String, Arc<CircuitBreaker>>) -> Vec<Arc<CircuitBreaker>> {
        breakers.values().cloned().collect()
    }

    /// Snapshot of every breaker, keyed by name.
    pub async fn get_all_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        let breakers = Self::registered(&*self.breakers.lock().await);
        let mut states = BTreeMap::new();
        for breaker in breakers {
            states.insert(breaker.name().to_string(), breaker.get_state().await);
        }
        states
    }

    /// Force-reset every registered breaker.
    pub async fn reset_all(&self) {
        let breakers = Self::registered(&*self.breakers.lock().await);
        for breaker in &breakers {
            breaker.force_reset().await;
        }
        info!(count = breakers.len(), "All circuit breakers reset");
    }

    /// Recompute the aggregate snapshot from the registered breakers.
    pub async fn refresh_global_stats(&self) -> GlobalStats {
        self.counters.dirty.store(false, Ordering::Release);
        let states = self.get_all_states().await;
        let mut stats = GlobalStats {
            total_breakers: states.len(),
            state_changes: self.counters.state_changes.load(Ordering::Relaxed),
            failure_events: self.counters.failure_events.load(Ordering::Relaxed),
            last_updated: Some(Utc::now()),
            ..Default::default()
        };
        for snapshot in states.values() {
            match snapshot.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
            stats.total_requests += snapshot.stats.total_requests;
            stats.total_failures += snapshot.stats.failed_requests;
        }
        *self.global.lock().await = stats.clone();
        stats
    }

    /// Aggregate snapshot. Served from cache unless a breaker event or a
    /// registry change happened since it was last computed.
    pub async fn global_stats(&self) -> GlobalStats {
        if self.counters.dirty.load(Ordering::Acquire) {
            return self.refresh_global_stats().await;
        }
        self.global.lock().await.clone()
    }

    /// Refresh the aggregate snapshot every `period` until shutdown.
    pub fn start_monitoring(self: &Arc<Self>, period: Duration) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            warn!("Circuit breaker monitoring is already running");
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        *monitor = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let stats = manager.refresh_global_stats().await;
                if stats.open > 0 {
                    warn!(open = stats.open, total = stats.total_breakers, "Circuit breakers open");
                }
            }
        }));
        info!(period_ms = period.as_millis() as u64, "Circuit breaker monitoring started");
    }

    /// Stop the monitoring task.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Circuit breaker monitoring stopped");
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CircuitBreakerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
