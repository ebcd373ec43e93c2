//! Error types for the relay.

use thiserror::Error;

/// Errors produced by the relay.
///
/// `Config` and `BackendConnect` are fatal at startup and abort before a
/// listener is bound. Everything else is scoped to the request or session
/// that triggered it.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend subprocess could not be launched or never completed its
    /// handshake. Never retried.
    #[error("backend connect error: {0}")]
    BackendConnect(String),

    /// A call forwarded over the backend channel failed. Surfaced to the
    /// requesting session as a JSON-RPC error response.
    #[error("backend call failed ({code}): {message}")]
    BackendCall { code: i64, message: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
