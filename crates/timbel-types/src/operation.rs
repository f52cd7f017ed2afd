use serde::{Deserialize, Serialize};

/// Failure reported by a wrapped operation (database call, HTTP request, ...).
///
/// Carries the fields resilience policies classify on: a free-form message,
/// an optional machine code (`ECONNRESET`, `23505`, ...), an error name,
/// the HTTP status if the failure came from a response, and the raw
/// `Retry-After` header value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OperationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let err = OperationError::new("rate limited")
            .with_status(429)
            .with_code("RATE_LIMIT")
            .with_retry_after("3");
        assert_eq!(err.status, Some(429));
        assert_eq!(err.code.as_deref(), Some("RATE_LIMIT"));
        assert_eq!(err.retry_after.as_deref(), Some("3"));
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn serde_skips_empty_fields() {
        let json = serde_json::to_value(OperationError::new("boom")).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "boom" }));
    }
}
