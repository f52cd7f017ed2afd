use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use timbel_types::Result;
use tracing::debug;

use super::dlq_item::DlqItem;

/// Outcome of one re-delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl RetryOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Re-issues the operation a DLQ item describes.
#[async_trait]
pub trait RetryItem: Send + Sync {
    async fn retry_item(&self, item: &DlqItem) -> RetryOutcome;
}

/// Base behaviour: nothing knows how to replay the item, so every attempt fails.
pub struct NoopRetry;

#[async_trait]
impl RetryItem for NoopRetry {
    async fn retry_item(&self, item: &DlqItem) -> RetryOutcome {
        debug!(item = %item.id, "No retry strategy configured");
        RetryOutcome {
            success: false,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Database operations
// ---------------------------------------------------------------------------

/// Executes a parameterized SQL statement.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Value>;
}

/// Payload shape for database-operation items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Replays failed database writes through a [`SqlExecutor`].
pub struct DatabaseOperationRetry {
    executor: Arc<dyn SqlExecutor>,
}

impl DatabaseOperationRetry {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Payload to enqueue for a failed statement.
    pub fn payload(operation: &str, query: &str, params: Vec<Value>) -> Value {
        serde_json::to_value(DatabaseOperation {
            operation: Some(operation.to_string()),
            query: query.to_string(),
            params,
        })
        .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl RetryItem for DatabaseOperationRetry {
    async fn retry_item(&self, item: &DlqItem) -> RetryOutcome {
        let op: DatabaseOperation = match serde_json::from_value(item.data.clone()) {
            Ok(op) => op,
            Err(e) => return RetryOutcome::failure(format!("Invalid database operation payload: {e}")),
        };
        match self.executor.execute(&op.query, &op.params).await {
            Ok(_) => RetryOutcome::success(),
            Err(e) => RetryOutcome::failure(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// API calls
// ---------------------------------------------------------------------------

/// Payload shape for API-call items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Sends an HTTP request and reports the response status.
#[async_trait]
pub trait HttpCaller: Send + Sync {
    async fn call(&self, request: &ApiRequest) -> Result<u16>;
}

/// Replays failed outbound API calls through an [`HttpCaller`].
/// Any 2xx response counts as delivered.
pub struct ApiCallRetry {
    caller: Arc<dyn HttpCaller>,
}

impl ApiCallRetry {
    pub fn new(caller: Arc<dyn HttpCaller>) -> Self {
        Self { caller }
    }

    pub fn payload(request: &ApiRequest) -> Value {
        serde_json::to_value(request).unwrap_or(Value::Null)
    }
}

#[async_trait]
impl RetryItem for ApiCallRetry {
    async fn retry_item(&self, item: &DlqItem) -> RetryOutcome {
        let request: ApiRequest = match serde_json::from_value(item.data.clone()) {
            Ok(request) => request,
            Err(e) => return RetryOutcome::failure(format!("Invalid API call payload: {e}")),
        };
        match self.caller.call(&request).await {
            Ok(status) if (200..300).contains(&status) => RetryOutcome::success(),
            Ok(status) => RetryOutcome::failure(format!("HTTP {status} from {} {}", request.method, request.url)),
            Err(e) => RetryOutcome::failure(e.to_string()),
        }
    }
}
