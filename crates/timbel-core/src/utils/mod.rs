pub mod breaker_manager;
pub mod circuit_breaker;
pub mod dead_letter_queue;
pub mod dlq_item;
pub mod dlq_manager;
pub mod dlq_retry;
pub mod dlq_store;
pub mod error_handler;
pub mod events;
pub mod fallback;
pub mod retry;

pub use breaker_manager::{CircuitBreakerManager, GlobalStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitEventKind, CircuitSnapshot,
    CircuitState, CircuitStats, ErrorMatcher, HealthStatus,
};
pub use dead_letter_queue::{DeadLetterQueue, DlqConfig, DlqStats, DlqStatus, DrainSummary};
pub use dlq_item::{queue_of, DlqItem, DlqMetadata, ErrorRecord, PersistAction, PersistedRecord};
pub use dlq_manager::{DeadLetterQueueManager, DlqKind};
pub use dlq_retry::{
    ApiCallRetry, ApiRequest, DatabaseOperationRetry, HttpCaller, NoopRetry, RetryItem,
    RetryOutcome, SqlExecutor,
};
pub use dlq_store::{DlqStore, FileStore, MemoryStore};
pub use error_handler::{ErrorHandler, FailureContext, LoggingErrorHandler};
pub use events::{BusEvent, EventBus};
pub use fallback::{FallbackConfig, FallbackHandler, FallbackOutcome, FallbackStats};
pub use retry::{
    is_retryable, is_retryable_api, is_retryable_database, with_retry, RetryConfig, RetryHandler,
    RetryStats,
};
