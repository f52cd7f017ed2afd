use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use timbel_config::Config;
use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::chrono_duration;
use super::dlq_item::{DlqItem, ErrorRecord, PersistAction};
use super::dlq_retry::{NoopRetry, RetryItem};
use super::dlq_store::{DlqStore, FileStore};
use super::error_handler::{ErrorHandler, FailureContext, LoggingErrorHandler};

/// Shortest interval between automatic processing passes.
const MIN_PROCESS_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound on a single item's backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for [`DeadLetterQueue`].
#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_retries: u32,
    /// Base delay; attempt `k` waits `retry_delay * 2^(k-1)`.
    pub retry_delay: Duration,
    pub max_queue_size: usize,
    pub persist_path: PathBuf,
    pub auto_process: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(60),
            max_queue_size: 10_000,
            persist_path: PathBuf::from("data").join("dlq"),
            auto_process: true,
        }
    }
}

impl DlqConfig {
    pub fn from_settings(config: &Config) -> Self {
        Self {
            max_retries: config.dlq_max_retries,
            retry_delay: Duration::from_millis(config.dlq_retry_delay_ms),
            max_queue_size: config.dlq_max_queue_size,
            persist_path: config.dlq_persist_path.clone(),
            auto_process: config.dlq_auto_process,
        }
    }

    /// Interval of the automatic processing timer.
    pub fn process_interval(&self) -> Duration {
        (self.retry_delay / 4).max(MIN_PROCESS_INTERVAL)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    pub total_items: u64,
    pub processed_items: u64,
    /// Items dropped without being delivered (permanent failures and overflow evictions).
    pub failed_items: u64,
    /// Failed re-delivery attempts.
    pub retried_items: u64,
    pub permanent_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStatusConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_queue_size: usize,
    pub auto_process: bool,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStatus {
    pub name: String,
    pub queue_size: usize,
    pub processing: bool,
    pub ready_items: usize,
    pub oldest_item: Option<DateTime<Utc>>,
    pub stats: DlqStats,
    pub config: DlqStatusConfig,
}

/// Result of [`DeadLetterQueue::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    pub attempts: usize,
    pub delivered: u64,
    pub permanently_failed: u64,
}

struct QueueState {
    items: VecDeque<DlqItem>,
    stats: DlqStats,
}

/// Resets the processing flag when a pass ends, even by panic.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Holds failed work items and re-delivers them with per-item exponential
/// backoff until they succeed or exhaust `max_retries`.
pub struct DeadLetterQueue {
    name: String,
    config: DlqConfig,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    store: Arc<dyn DlqStore>,
    retrier: Arc<dyn RetryItem>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    /// Queue persisting to `config.persist_path`, with no retry strategy.
    pub fn new(name: impl Into<String>, config: DlqConfig) -> Self {
        let store = Arc::new(FileStore::new(config.persist_path.clone()));
        Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stats: DlqStats::default(),
            }),
            processing: AtomicBool::new(false),
            timer: std::sync::Mutex::new(None),
            store,
            retrier: Arc::new(NoopRetry),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DlqStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_retrier(mut self, retrier: Arc<dyn RetryItem>) -> Self {
        self.retrier = retrier;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Share the queue and, if `auto_process` is set, start its timer.
    pub fn start(self) -> Arc<Self> {
        let queue = Arc::new(self);
        if queue.config.auto_process {
            queue.spawn_timer();
        }
        info!(
            queue = %queue.name,
            max_retries = queue.config.max_retries,
            retry_delay_ms = queue.config.retry_delay.as_millis() as u64,
            auto_process = queue.config.auto_process,
            "Dead letter queue started"
        );
        queue
    }

    fn spawn_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return;
        }
        let interval = self.config.process_interval();
        let queue: Weak<Self> = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                if !queue.is_processing() && !queue.is_empty().await {
                    queue.process_queue().await;
                }
            }
        }));
    }

    /// Cancel the automatic processing timer.
    pub fn stop(&self) {
        if let Some(handle) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!(queue = %self.name, "Dead letter queue stopped");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    pub async fn stats(&self) -> DlqStats {
        self.state.lock().await.stats.clone()
    }

    /// Enqueue a failed operation. A full queue evicts its oldest item.
    pub async fn add(&self, data: Value, metadata: Map<String, Value>) -> String {
        let item = DlqItem::new(&self.name, data, metadata);
        let id = item.id.clone();

        let evicted = {
            let mut state = self.state.lock().await;
            let evicted = if state.items.len() >= self.config.max_queue_size {
                state.stats.failed_items += 1;
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item.clone());
            state.stats.total_items += 1;
            evicted
        };

        if let Some(evicted) = evicted {
            warn!(queue = %self.name, item = %evicted.id, "Dead letter queue full, evicting oldest item");
            self.persist(&evicted, PersistAction::Overflow).await;
        }
        self.persist(&item, PersistAction::Added).await;

        info!(queue = %self.name, item = %id, source = %item.metadata.source, "Item added to dead letter queue");
        id
    }

    /// Run one pass over the items that are due. Returns the number of
    /// items attempted, or `None` if a pass was already running.
    pub async fn process_queue(&self) -> Option<usize> {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.name, "Processing pass already running");
            return None;
        }
        let _guard = ProcessingGuard(&self.processing);

        let now = Utc::now();
        let ready: Vec<String> = {
            let state = self.state.lock().await;
            state
                .items
                .iter()
                .filter(|item| {
                    now >= item.metadata.next_retry && item.metadata.attempts < self.config.max_retries
                })
                .map(|item| item.id.clone())
                .collect()
        };

        if !ready.is_empty() {
            info!(queue = %self.name, ready = ready.len(), "Processing dead letter queue");
        }
        for id in &ready {
            self.process_item(id).await;
        }

        let now = Utc::now();
        let max_retries = self.config.max_retries;
        self.state.lock().await.items.retain(|item| {
            item.metadata.attempts < max_retries || item.metadata.next_retry > now
        });

        Some(ready.len())
    }

    /// Attempt one item. Returns whether it was delivered.
    async fn process_item(&self, id: &str) -> bool {
        let mut item = {
            let mut state = self.state.lock().await;
            let Some(queued) = state.items.iter_mut().find(|item| item.id == id) else {
                return false;
            };
            queued.metadata.attempts += 1;
            queued.metadata.last_attempt = Some(Utc::now());
            queued.clone()
        };

        debug!(queue = %self.name, item = %id, attempt = item.metadata.attempts, "Retrying item");
        let outcome = self.retrier.retry_item(&item).await;

        if outcome.success {
            {
                let mut state = self.state.lock().await;
                state.stats.processed_items += 1;
                state.items.retain(|queued| queued.id != id);
            }
            info!(queue = %self.name, item = %id, attempts = item.metadata.attempts, "Item processed successfully");
            self.persist(&item, PersistAction::Processed).await;
            return true;
        }

        let now = Utc::now();
        let attempts = item.metadata.attempts;
        item.metadata.error_history.push(ErrorRecord {
            attempt: attempts,
            error: outcome.error.unwrap_or_else(|| "Unknown error".to_string()),
            timestamp: now,
        });

        if attempts >= self.config.max_retries {
            {
                let mut state = self.state.lock().await;
                state.stats.retried_items += 1;
                state.stats.permanent_failures += 1;
                state.stats.failed_items += 1;
                state.items.retain(|queued| queued.id != id);
            }
            self.handle_permanent_failure(&item).await;
            return false;
        }

        let backoff = self.retry_backoff(attempts);
        item.metadata.next_retry = now + chrono_duration(backoff);
        {
            let mut state = self.state.lock().await;
            state.stats.retried_items += 1;
            if let Some(queued) = state.items.iter_mut().find(|queued| queued.id == id) {
                *queued = item.clone();
            }
        }
        warn!(
            queue = %self.name,
            item = %id,
            attempt = attempts,
            max_retries = self.config.max_retries,
            next_retry_ms = backoff.as_millis() as u64,
            error = item.last_error().unwrap_or_default(),
            "Item retry failed"
        );
        self.persist(&item, PersistAction::RetryFailed).await;
        false
    }

    async fn handle_permanent_failure(&self, item: &DlqItem) {
        let last_error = item.last_error().unwrap_or("Unknown error");
        error!(
            queue = %self.name,
            item = %item.id,
            attempts = item.metadata.attempts,
            error = last_error,
            "Item permanently failed"
        );
        self.persist(item, PersistAction::PermanentFailure).await;

        let err = TimbelError::Other(format!(
            "DLQ item {} permanently failed after {} attempts: {last_error}",
            item.id, item.metadata.attempts
        ));
        let context = FailureContext {
            component: "DeadLetterQueue".to_string(),
            queue: self.name.clone(),
            item_id: item.id.clone(),
            attempts: item.metadata.attempts,
            source: item.metadata.source.clone(),
            data: item.data.clone(),
            error_history: item.metadata.error_history.clone(),
        };
        self.error_handler.handle_error(&err, &context).await;
    }

    /// Delay scheduled after the given number of failed attempts.
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.config
            .retry_delay
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF)
    }

    /// Run a pass now, unless one is already running.
    pub async fn manual_process(&self) -> Option<usize> {
        info!(queue = %self.name, "Manual processing requested");
        self.process_queue().await
    }

    /// Attempt one item immediately, ignoring its schedule.
    pub async fn force_retry(&self, id: &str) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let item = state
                .items
                .iter_mut()
                .find(|item| item.id == id)
                .ok_or_else(|| TimbelError::ItemNotFound(id.to_string()))?;
            item.metadata.next_retry = Utc::now();
        }
        info!(queue = %self.name, item = %id, "Forcing retry");
        Ok(self.process_item(id).await)
    }

    /// Attempt every queued item, ignoring schedules, until each one is
    /// delivered or permanently failed. Returns `None` if a pass was
    /// already running.
    pub async fn drain(&self) -> Option<DrainSummary> {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.name, "Processing pass already running");
            return None;
        }
        let _guard = ProcessingGuard(&self.processing);

        let before = self.stats().await;
        let mut attempts = 0;
        loop {
            let ids: Vec<String> = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                state
                    .items
                    .iter_mut()
                    .map(|item| {
                        item.metadata.next_retry = now;
                        item.id.clone()
                    })
                    .collect()
            };
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                self.process_item(id).await;
                attempts += 1;
            }
        }

        let after = self.stats().await;
        let summary = DrainSummary {
            attempts,
            delivered: after.processed_items.saturating_sub(before.processed_items),
            permanently_failed: after.permanent_failures.saturating_sub(before.permanent_failures),
        };
        info!(
            queue = %self.name,
            attempts = summary.attempts,
            delivered = summary.delivered,
            permanently_failed = summary.permanently_failed,
            "Dead letter queue drained"
        );
        Some(summary)
    }

    /// Drop every queued item and zero the stats. Returns the number dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.items.len();
        state.items.clear();
        state.stats = DlqStats::default();
        info!(queue = %self.name, cleared, "Dead letter queue cleared");
        cleared
    }

    /// Re-enqueue persisted items that are not already in memory.
    pub async fn recover_from_disk(&self) -> Result<usize> {
        let persisted = self.store.recover(&self.name).await?;

        let mut state = self.state.lock().await;
        let mut known: HashSet<String> = state.items.iter().map(|item| item.id.clone()).collect();
        let mut recovered = 0;
        for item in persisted {
            if known.insert(item.id.clone()) {
                state.items.push_back(item);
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(queue = %self.name, recovered, "Recovered dead letter items from disk");
        }
        Ok(recovered)
    }

    pub async fn get_status(&self) -> DlqStatus {
        let now = Utc::now();
        let state = self.state.lock().await;
        DlqStatus {
            name: self.name.clone(),
            queue_size: state.items.len(),
            processing: self.is_processing(),
            ready_items: state
                .items
                .iter()
                .filter(|item| {
                    now >= item.metadata.next_retry && item.metadata.attempts < self.config.max_retries
                })
                .count(),
            oldest_item: state.items.front().map(|item| item.metadata.added_at),
            stats: state.stats.clone(),
            config: DlqStatusConfig {
                max_retries: self.config.max_retries,
                retry_delay_ms: self.config.retry_delay.as_millis() as u64,
                max_queue_size: self.config.max_queue_size,
                auto_process: self.config.auto_process,
            },
        }
    }

    /// Up to `limit` queued items, oldest first.
    pub async fn get_items(&self, limit: usize) -> Vec<DlqItem> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    async fn persist(&self, item: &DlqItem, action: PersistAction) {
        if let Err(e) = self.store.persist(item, action).await {
            error!(queue = %self.name, item = %item.id, %action, error = %e, "Failed to persist DLQ item");
        }
    }
}

impl Drop for DeadLetterQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::dlq_retry::RetryOutcome;
    use crate::utils::dlq_store::{DlqStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct AlwaysFails;

    #[async_trait]
    impl RetryItem for AlwaysFails {
        async fn retry_item(&self, _item: &DlqItem) -> RetryOutcome {
            RetryOutcome::failure("x")
        }
    }

    /// Fails until the given attempt, then succeeds.
    struct SucceedsOn(u32);

    #[async_trait]
    impl RetryItem for SucceedsOn {
        async fn retry_item(&self, item: &DlqItem) -> RetryOutcome {
            if item.metadata.attempts >= self.0 {
                RetryOutcome::success()
            } else {
                RetryOutcome::failure("not yet")
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicU32,
        last: std::sync::Mutex<Option<FailureContext>>,
    }

    #[async_trait]
    impl ErrorHandler for CountingHandler {
        async fn handle_error(&self, _error: &TimbelError, context: &FailureContext) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(context.clone());
        }
    }

    fn config(max_retries: u32, retry_delay_ms: u64) -> DlqConfig {
        DlqConfig {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
            auto_process: false,
            ..Default::default()
        }
    }

    fn queue(name: &str, config: DlqConfig, store: &Arc<MemoryStore>) -> DeadLetterQueue {
        DeadLetterQueue::new(name, config).with_store(store.clone())
    }

    async fn make_due(queue: &DeadLetterQueue) {
        let mut state = queue.state.lock().await;
        for item in state.items.iter_mut() {
            item.metadata.next_retry = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    #[tokio::test]
    async fn add_persists_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("orders", config(3, 1000), &store);

        let id = dlq.add(json!({ "order": 1 }), Map::new()).await;

        assert!(id.starts_with("DLQ_orders_"));
        assert_eq!(dlq.len().await, 1);
        assert_eq!(dlq.stats().await.total_items, 1);
        assert_eq!(store.actions_for(&id).await, vec![PersistAction::Added]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(3, 1000);
        cfg.max_queue_size = 2;
        let dlq = queue("q", cfg, &store);

        let first = dlq.add(json!(1), Map::new()).await;
        let second = dlq.add(json!(2), Map::new()).await;
        let third = dlq.add(json!(3), Map::new()).await;

        let ids: Vec<String> = dlq.get_items(10).await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second, third]);
        assert_eq!(
            store.actions_for(&first).await,
            vec![PersistAction::Added, PersistAction::Overflow]
        );
        assert_eq!(dlq.stats().await.failed_items, 1);
    }

    #[tokio::test]
    async fn failed_attempts_back_off_exponentially() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 1000), &store).with_retrier(Arc::new(AlwaysFails));
        dlq.add(json!(null), Map::new()).await;

        for k in 1..=3u32 {
            make_due(&dlq).await;
            assert_eq!(dlq.process_queue().await, Some(1));

            let item = &dlq.get_items(1).await[0];
            assert_eq!(item.metadata.attempts, k);
            assert_eq!(item.metadata.error_history.len(), k as usize);
            let last_attempt = item.metadata.last_attempt.unwrap();
            let gap = (item.metadata.next_retry - last_attempt).num_milliseconds();
            let expected = 1000 * 2i64.pow(k - 1);
            assert!((gap - expected).abs() < 100, "attempt {k}: gap {gap}ms, expected {expected}ms");
        }
        assert_eq!(dlq.stats().await.retried_items, 3);
    }

    #[tokio::test]
    async fn items_not_due_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 60_000), &store).with_retrier(Arc::new(AlwaysFails));
        dlq.add(json!(null), Map::new()).await;

        assert_eq!(dlq.process_queue().await, Some(1));
        assert_eq!(dlq.process_queue().await, Some(0));
        assert_eq!(dlq.get_items(1).await[0].metadata.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_item_fails_permanently_once() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler::default());
        let dlq = queue("q", config(3, 10), &store)
            .with_retrier(Arc::new(AlwaysFails))
            .with_error_handler(handler.clone());
        let id = dlq.add(json!({ "k": "v" }), Map::new()).await;

        for _ in 0..6 {
            make_due(&dlq).await;
            dlq.process_queue().await;
        }

        assert!(dlq.is_empty().await);
        let stats = dlq.stats().await;
        assert_eq!(stats.permanent_failures, 1);
        assert_eq!(stats.retried_items, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let context = handler.last.lock().unwrap().clone().unwrap();
        assert_eq!(context.item_id, id);
        assert_eq!(context.attempts, 3);
        assert_eq!(context.error_history.len(), 3);
        assert_eq!(
            store.actions_for(&id).await.last(),
            Some(&PersistAction::PermanentFailure)
        );
    }

    #[tokio::test]
    async fn successful_retry_removes_item() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 10), &store).with_retrier(Arc::new(SucceedsOn(2)));
        let id = dlq.add(json!(null), Map::new()).await;

        make_due(&dlq).await;
        dlq.process_queue().await;
        make_due(&dlq).await;
        dlq.process_queue().await;

        assert!(dlq.is_empty().await);
        assert_eq!(dlq.stats().await.processed_items, 1);
        assert_eq!(
            store.actions_for(&id).await,
            vec![PersistAction::Added, PersistAction::RetryFailed, PersistAction::Processed]
        );
    }

    #[tokio::test]
    async fn force_retry_ignores_schedule() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 60_000), &store).with_retrier(Arc::new(SucceedsOn(2)));
        let id = dlq.add(json!(null), Map::new()).await;

        dlq.process_queue().await;
        assert_eq!(dlq.process_queue().await, Some(0));

        assert!(dlq.force_retry(&id).await.unwrap());
        assert!(dlq.is_empty().await);

        let err = dlq.force_retry(&id).await.unwrap_err();
        assert!(matches!(err, TimbelError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn overlapping_pass_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 10), &store);
        dlq.processing.store(true, Ordering::SeqCst);
        assert_eq!(dlq.manual_process().await, None);
        dlq.processing.store(false, Ordering::SeqCst);
        assert_eq!(dlq.manual_process().await, Some(0));
    }

    #[tokio::test]
    async fn drain_settles_every_item() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(3, 60_000), &store).with_retrier(Arc::new(SucceedsOn(2)));
        let delivered = dlq.add(json!(1), Map::new()).await;

        let summary = dlq.drain().await.unwrap();

        assert!(dlq.is_empty().await);
        assert_eq!(summary, DrainSummary { attempts: 2, delivered: 1, permanently_failed: 0 });
        assert_eq!(store.actions_for(&delivered).await.last(), Some(&PersistAction::Processed));

        let failing = queue("f", config(3, 60_000), &store).with_retrier(Arc::new(AlwaysFails));
        let given_up = failing.add(json!(2), Map::new()).await;
        let summary = failing.drain().await.unwrap();

        assert!(failing.is_empty().await);
        assert_eq!(summary, DrainSummary { attempts: 3, delivered: 0, permanently_failed: 1 });
        assert!(store.recover("f").await.unwrap().is_empty());
        assert_eq!(
            store.actions_for(&given_up).await.last(),
            Some(&PersistAction::PermanentFailure)
        );
    }

    #[tokio::test]
    async fn drain_is_rejected_while_processing() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(3, 10), &store);
        dlq.processing.store(true, Ordering::SeqCst);
        assert_eq!(dlq.drain().await, None);
    }

    #[tokio::test]
    async fn recovery_keeps_items_whose_metadata_reuses_item_field_names() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(5, 1000);
        cfg.persist_path = tmp.path().to_path_buf();

        let original = DeadLetterQueue::new("bugs", cfg.clone());
        let mut meta = Map::new();
        meta.insert("source".into(), json!("bug-reports"));
        meta.insert("attempts".into(), json!(3));
        let id = original.add(json!({ "x": 1 }), meta).await;

        let restarted = DeadLetterQueue::new("bugs", cfg);
        assert_eq!(restarted.recover_from_disk().await.unwrap(), 1);

        let item = &restarted.get_items(1).await[0];
        assert_eq!(item.id, id);
        assert_eq!(item.metadata.attempts, 0);
        assert_eq!(item.metadata.source, "bug-reports");
        assert_eq!(item.metadata.context["attempts"], 3);
    }

    #[tokio::test]
    async fn clear_empties_queue_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 10), &store);
        dlq.add(json!(1), Map::new()).await;
        dlq.add(json!(2), Map::new()).await;

        assert_eq!(dlq.clear().await, 2);
        assert!(dlq.is_empty().await);
        assert_eq!(dlq.stats().await, DlqStats::default());
    }

    #[tokio::test]
    async fn recovery_skips_items_already_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(5, 1000);
        cfg.persist_path = tmp.path().to_path_buf();

        let original = DeadLetterQueue::new("jobs", cfg.clone());
        let a = original.add(json!("a"), Map::new()).await;
        let b = original.add(json!("b"), Map::new()).await;

        let restarted = DeadLetterQueue::new("jobs", cfg.clone());
        assert_eq!(restarted.recover_from_disk().await.unwrap(), 2);
        assert_eq!(restarted.recover_from_disk().await.unwrap(), 0);

        let mut ids: Vec<String> = restarted.get_items(10).await.into_iter().map(|i| i.id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        let other = DeadLetterQueue::new("jobs_archive", cfg);
        assert_eq!(other.recover_from_disk().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_reports_ready_items() {
        let store = Arc::new(MemoryStore::new());
        let dlq = queue("q", config(5, 60_000), &store).with_retrier(Arc::new(AlwaysFails));
        dlq.add(json!(1), Map::new()).await;
        dlq.process_queue().await;
        dlq.add(json!(2), Map::new()).await;

        let status = dlq.get_status().await;
        assert_eq!(status.queue_size, 2);
        assert_eq!(status.ready_items, 1);
        assert!(!status.processing);
        assert!(status.oldest_item.is_some());
        assert_eq!(status.config.retry_delay_ms, 60_000);
    }

    #[test]
    fn process_interval_has_floor() {
        assert_eq!(config(5, 1000).process_interval(), Duration::from_secs(15));
        assert_eq!(config(5, 120_000).process_interval(), Duration::from_secs(30));
    }

    #[test]
    fn backoff_saturates() {
        let dlq = DeadLetterQueue::new("q", config(5, 1000));
        assert_eq!(dlq.retry_backoff(1), Duration::from_secs(1));
        assert_eq!(dlq.retry_backoff(4), Duration::from_secs(8));
        assert_eq!(dlq.retry_backoff(200), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_process_timer_runs_passes() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(5, 1000);
        cfg.auto_process = true;
        let dlq = queue("q", cfg, &store)
            .with_retrier(Arc::new(SucceedsOn(1)))
            .start();
        dlq.add(json!(null), Map::new()).await;

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(dlq.is_empty().await);
        assert_eq!(dlq.stats().await.processed_items, 1);
        dlq.stop();
    }
}
