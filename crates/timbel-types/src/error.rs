use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::operation::OperationError;

/// Top-level error type for Timbel.
#[derive(Error, Debug)]
pub enum TimbelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Operation(#[from] OperationError),

    #[error("Circuit breaker {name} is OPEN. Next attempt at {next_attempt}")]
    CircuitOpen {
        name: String,
        next_attempt: DateTime<Utc>,
    },

    #[error("{name} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        name: String,
        attempts: u32,
        max_retries: u32,
        elapsed: Duration,
        source: Box<TimbelError>,
    },

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Both primary and fallback failed. Primary: {primary}, Fallback: {fallback}")]
    FallbackExhausted {
        primary: Box<TimbelError>,
        fallback: Box<TimbelError>,
    },

    #[error("DLQ item not found: {0}")]
    ItemNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl TimbelError {
    pub const CIRCUIT_OPEN: &'static str = "CIRCUIT_OPEN";
    pub const RETRY_EXHAUSTED: &'static str = "RETRY_EXHAUSTED";
    pub const TIMEOUT: &'static str = "TIMEOUT";
    pub const FALLBACK_EXHAUSTED: &'static str = "FALLBACK_EXHAUSTED";

    /// Machine-readable error kind.
    ///
    /// Resilience failures report their taxonomy code, operation failures
    /// report their own code, and IO errors map onto the usual socket codes.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { .. } => Some(Self::CIRCUIT_OPEN),
            Self::RetryExhausted { .. } => Some(Self::RETRY_EXHAUSTED),
            Self::Timeout(_) => Some(Self::TIMEOUT),
            Self::FallbackExhausted { .. } => Some(Self::FALLBACK_EXHAUSTED),
            Self::Operation(op) => op.code.as_deref(),
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                std::io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                std::io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                _ => None,
            },
            _ => None,
        }
    }

    /// Error name, when one is known.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Timeout(_) => Some("TimeoutError"),
            Self::Operation(op) => op.name.as_deref(),
            _ => None,
        }
    }

    /// HTTP status reported by the failing operation.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Operation(op) => op.status,
            _ => None,
        }
    }

    /// Raw `Retry-After` header value reported by the failing operation.
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::Operation(op) => op.retry_after.as_deref(),
            _ => None,
        }
    }

    /// Whether this failure is a timeout, either by kind or by name.
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(Self::TIMEOUT) || self.name() == Some("TimeoutError")
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, TimbelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TimbelError::Config("missing key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TimbelError = io_err.into();
        assert!(err.to_string().contains("file not found"));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn io_kind_maps_to_socket_code() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: TimbelError = io_err.into();
        assert_eq!(err.code(), Some("ECONNRESET"));
    }

    #[test]
    fn taxonomy_codes() {
        let open = TimbelError::CircuitOpen {
            name: "db".to_string(),
            next_attempt: Utc::now(),
        };
        assert_eq!(open.code(), Some("CIRCUIT_OPEN"));
        assert!(open.to_string().contains("db"));

        let timeout = TimbelError::Timeout(Duration::from_millis(50));
        assert_eq!(timeout.code(), Some("TIMEOUT"));
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "Operation timed out after 50ms");

        let exhausted = TimbelError::RetryExhausted {
            name: "fetch".to_string(),
            attempts: 3,
            max_retries: 2,
            elapsed: Duration::from_millis(300),
            source: Box::new(OperationError::new("503").into()),
        };
        assert_eq!(exhausted.code(), Some("RETRY_EXHAUSTED"));
        assert!(std::error::Error::source(&exhausted).is_some());
    }

    #[test]
    fn operation_fields_surface() {
        let err: TimbelError = OperationError::new("throttled")
            .with_status(429)
            .with_retry_after("2")
            .into();
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some("2"));
        assert_eq!(err.to_string(), "throttled");
    }
}
