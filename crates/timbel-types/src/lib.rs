pub mod error;
pub mod operation;

// Re-exports for convenience
pub use error::{Result, TimbelError};
pub use operation::OperationError;
