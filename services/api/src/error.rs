//! services/api/src/error.rs
//!
//! Defines the primary error type for the API service, and the mapping of core
//! errors onto HTTP responses.

use crate::config::ConfigError;
use axum::http::StatusCode;
use guardian_core::error::CoreError;
use guardian_core::ports::PortError;
use tracing::error;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migrations failed to apply.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An outbound HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// The `(status, message)` pair every handler returns on failure.
pub type HttpError = (StatusCode, String);

/// Maps a core error onto an HTTP status. Internal details are logged, not returned.
pub fn to_http(err: CoreError) -> HttpError {
    match err {
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        CoreError::Authorization(msg) => (StatusCode::FORBIDDEN, msg),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        CoreError::DependencyUnavailable(msg) => {
            error!("Dependency unavailable: {}", msg);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "A required service is unavailable".to_string(),
            )
        }
        CoreError::Internal(msg) => {
            error!("Internal error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error occurred".to_string(),
            )
        }
    }
}
