use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::dead_letter_queue::{DeadLetterQueue, DlqConfig, DlqStatus};
use super::dlq_retry::{ApiCallRetry, DatabaseOperationRetry, HttpCaller, NoopRetry, RetryItem, SqlExecutor};
use super::dlq_store::DlqStore;
use super::error_handler::{ErrorHandler, LoggingErrorHandler};

/// Which re-delivery strategy a managed queue uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DlqKind {
    #[default]
    Base,
    DatabaseOperation,
    ApiCall,
}

impl fmt::Display for DlqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::DatabaseOperation => write!(f, "database"),
            Self::ApiCall => write!(f, "api"),
        }
    }
}

impl FromStr for DlqKind {
    type Err = TimbelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "database" | "db" => Ok(Self::DatabaseOperation),
            "api" => Ok(Self::ApiCall),
            other => Err(TimbelError::Config(format!("Unknown DLQ type: {other}"))),
        }
    }
}

/// Named registry of dead letter queues sharing one set of collaborators.
pub struct DeadLetterQueueManager {
    queues: Mutex<HashMap<String, Arc<DeadLetterQueue>>>,
    error_handler: Arc<dyn ErrorHandler>,
    sql: Option<Arc<dyn SqlExecutor>>,
    http: Option<Arc<dyn HttpCaller>>,
    store: Option<Arc<dyn DlqStore>>,
}

impl DeadLetterQueueManager {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            error_handler: Arc::new(LoggingErrorHandler),
            sql: None,
            http: None,
            store: None,
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_sql_executor(mut self, executor: Arc<dyn SqlExecutor>) -> Self {
        self.sql = Some(executor);
        self
    }

    pub fn with_http_caller(mut self, caller: Arc<dyn HttpCaller>) -> Self {
        self.http = Some(caller);
        self
    }

    /// Use one store for every queue instead of a file store per queue.
    pub fn with_store(mut self, store: Arc<dyn DlqStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn retrier_for(&self, kind: DlqKind) -> Result<Arc<dyn RetryItem>> {
        match kind {
            DlqKind::Base => Ok(Arc::new(NoopRetry)),
            DlqKind::DatabaseOperation => {
                let sql = self.sql.clone().ok_or_else(|| {
                    TimbelError::Config("Database DLQ requires a SQL executor".to_string())
                })?;
                Ok(Arc::new(DatabaseOperationRetry::new(sql)))
            }
            DlqKind::ApiCall => {
                let http = self.http.clone().ok_or_else(|| {
                    TimbelError::Config("API call DLQ requires an HTTP caller".to_string())
                })?;
                Ok(Arc::new(ApiCallRetry::new(http)))
            }
        }
    }

    /// Create and start a queue, or return the one already registered under `name`.
    pub async fn create(&self, name: &str, kind: DlqKind, config: DlqConfig) -> Result<Arc<DeadLetterQueue>> {
        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(name) {
            warn!(queue = %name, "Dead letter queue already exists, returning existing instance");
            return Ok(Arc::clone(existing));
        }

        let mut queue = DeadLetterQueue::new(name, config)
            .with_retrier(self.retrier_for(kind)?)
            .with_error_handler(Arc::clone(&self.error_handler));
        if let Some(store) = &self.store {
            queue = queue.with_store(Arc::clone(store));
        }
        let queue = queue.start();

        queues.insert(name.to_string(), Arc::clone(&queue));
        info!(queue = %name, %kind, "Dead letter queue registered");
        Ok(queue)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<DeadLetterQueue>> {
        self.queues.lock().await.get(name).cloned()
    }

    /// Unregister a queue and stop its timer.
    pub async fn remove(&self, name: &str) -> bool {
        match self.queues.lock().await.remove(name) {
            Some(queue) => {
                queue.stop();
                info!(queue = %name, "Dead letter queue removed");
                true
            }
            None => false,
        }
    }

    async fn registered(&self) -> Vec<Arc<DeadLetterQueue>> {
        self.queues.lock().await.values().cloned().collect()
    }

    pub async fn get_all_status(&self) -> BTreeMap<String, DlqStatus> {
        let mut statuses = BTreeMap::new();
        for queue in self.registered().await {
            statuses.insert(queue.name().to_string(), queue.get_status().await);
        }
        statuses
    }

    /// Run a processing pass on every queue. Queues already mid-pass are skipped.
    pub async fn process_all(&self) -> BTreeMap<String, Option<usize>> {
        let mut processed = BTreeMap::new();
        for queue in self.registered().await {
            processed.insert(queue.name().to_string(), queue.process_queue().await);
        }
        processed
    }

    /// Reload persisted items into every queue. Returns the total recovered.
    pub async fn recover_all(&self) -> usize {
        let mut total = 0;
        for queue in self.registered().await {
            match queue.recover_from_disk().await {
                Ok(count) => total += count,
                Err(e) => error!(queue = %queue.name(), error = %e, "Failed to recover dead letter queue"),
            }
        }
        total
    }

    /// Stop every queue's timer.
    pub async fn shutdown(&self) {
        let queues = self.registered().await;
        for queue in &queues {
            queue.stop();
        }
        info!(count = queues.len(), "Dead letter queues shut down");
    }
}

impl Default for DeadLetterQueueManager {
    fn default() -> Self {
        Self::new()
    }
}
