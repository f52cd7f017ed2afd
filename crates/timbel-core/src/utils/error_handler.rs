use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use timbel_types::TimbelError;
use tracing::error;

use super::dlq_item::ErrorRecord;

/// Context handed to the error handler when a DLQ item is given up on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub component: String,
    pub queue: String,
    pub item_id: String,
    pub attempts: u32,
    pub source: String,
    pub data: Value,
    pub error_history: Vec<ErrorRecord>,
}

/// Receives failures that no caller is left to observe.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle_error(&self, error: &TimbelError, context: &FailureContext);
}

/// Logs every reported failure at `error` level.
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle_error(&self, err: &TimbelError, context: &FailureContext) {
        let history = serde_json::to_string(&context.error_history).unwrap_or_default();
        error!(
            component = %context.component,
            queue = %context.queue,
            item = %context.item_id,
            attempts = context.attempts,
            source = %context.source,
            history = %history,
            error = %err,
            "Unrecoverable failure"
        );
    }
}
