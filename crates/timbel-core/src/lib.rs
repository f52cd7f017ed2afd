pub mod logging;
pub mod utils;

pub use logging::{init_logging, init_logging_from};
pub use utils::{
    with_retry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
    DeadLetterQueue, DeadLetterQueueManager, DlqConfig, DlqKind, FallbackConfig, FallbackHandler,
    RetryConfig, RetryHandler,
};
