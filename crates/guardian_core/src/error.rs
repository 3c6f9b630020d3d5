//! crates/guardian_core/src/error.rs
//!
//! The error type returned by the core's operations.

use crate::ports::PortError;

/// Errors surfaced synchronously to the caller of a core operation.
///
/// Notification failures are deliberately absent: they are captured per recipient by
/// the fanout dispatcher and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or missing input; correctable by the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The actor may not act on the resource.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// A domain invariant would be violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage could not be reached.
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl From<PortError> for CoreError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(what) => CoreError::NotFound(what),
            PortError::Conflict(what) => CoreError::Conflict(what),
            PortError::Unavailable(what) => CoreError::DependencyUnavailable(what),
            PortError::Unexpected(what) => CoreError::Internal(what),
        }
    }
}

/// A convenience type alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;
