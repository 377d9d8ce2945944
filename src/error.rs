/// Unified error types for the server key service
use crate::keys::{KeyIdentifier, LookupResults};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for key resolution and the internal API
#[derive(Error, Debug)]
pub enum ServerKeyError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Writing keys into the key database failed
    #[error("Failed to store keys: {0}")]
    StorePersistence(String),

    /// Some requested keys could not be resolved by any tier
    #[error("Failed to fetch {} keys", .0.missing.len())]
    KeysMissing(Box<MissingKeys>),

    /// A single key fetcher failed
    #[error("Key fetcher {fetcher} failed: {message}")]
    Fetcher { fetcher: String, message: String },

    /// Malformed request body at the internal API boundary
    #[error("Invalid request body: {0}")]
    Decode(String),

    /// Remote call to the key service failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Room state could not be found for event building
    #[error("Room does not exist: {0}")]
    RoomNotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Partial outcome of a key lookup.
///
/// `resolved` holds every key that was found; `missing` lists the
/// identifiers that no tier could answer.
#[derive(Debug, Clone, Default)]
pub struct MissingKeys {
    pub resolved: LookupResults,
    pub missing: Vec<KeyIdentifier>,
}

impl ServerKeyError {
    /// Build a partial-resolution error
    pub fn keys_missing(resolved: LookupResults, missing: Vec<KeyIdentifier>) -> Self {
        ServerKeyError::KeysMissing(Box::new(MissingKeys { resolved, missing }))
    }

    /// Number of identifiers left unresolved, if this is a partial-resolution error
    pub fn missing_count(&self) -> Option<usize> {
        match self {
            ServerKeyError::KeysMissing(partial) => Some(partial.missing.len()),
            _ => None,
        }
    }
}

/// Error response body used by the internal HTTP API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ServerKeyError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ServerKeyError::Decode(_) => (
                StatusCode::BAD_REQUEST,
                "BadJson",
                self.to_string(),
            ),
            ServerKeyError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            ServerKeyError::KeysMissing(_) => (
                StatusCode::NOT_FOUND,
                "KeysMissing",
                self.to_string(),
            ),
            ServerKeyError::RoomNotFound(_) => (
                StatusCode::NOT_FOUND,
                "RoomNotFound",
                self.to_string(),
            ),
            ServerKeyError::Transport(_) | ServerKeyError::Fetcher { .. } => (
                StatusCode::BAD_GATEWAY,
                "UpstreamError",
                self.to_string(),
            ),
            ServerKeyError::StorePersistence(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "StoreFailed",
                self.to_string(),
            ),
            ServerKeyError::Database(_) | ServerKeyError::Internal(_) | ServerKeyError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for key service operations
pub type ServerKeyResult<T> = Result<T, ServerKeyError>;
