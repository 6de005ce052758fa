//! Threadsync - realtime conversation core
//!
//! This library provides the pieces behind two-party messaging threads:
//! encrypted message persistence, delivery-state tracking, live fan-out to
//! connected sessions and client-side offline state reconciliation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod crypto;
pub mod message_service;
pub mod protocol;
pub mod realtime;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod thread_manager;
pub mod unread;

#[cfg(test)]
mod tests;

use tracing_subscriber::EnvFilter;

/// Result type alias for Threadsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Threadsync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input rejected before persistence (empty content, malformed identifiers)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller is not a participant of the thread
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown thread or message
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness race (duplicate pair, duplicate client reference)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage or network hiccup, eligible for retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Cryptographic operation error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage operation error
    #[error("Storage error: {0}")]
    Storage(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// CBOR serialization error
    #[error("CBOR serialization error: {0}")]
    CborSerialization(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP/Hyper error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Validation, Forbidden and NotFound are returned to the caller verbatim
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Forbidden(_) | Error::NotFound(_)
        )
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::JsonSerialization(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            e if e.is_retryable() => 503,
            _ => 500,
        }
    }

    /// Stable error code used in wire error frames
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::JsonSerialization(_) => "validation",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            e if e.is_retryable() => "transient",
            _ => "internal",
        }
    }

    /// Rebuild an error from a wire code and message
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "validation" => Error::Validation(message),
            "forbidden" => Error::Forbidden(message),
            "not_found" => Error::NotFound(message),
            "conflict" => Error::Conflict(message),
            "transient" => Error::Transient(message),
            _ => Error::Transport(message),
        }
    }
}

/// Initialize logging; honours `RUST_LOG`, defaulting to `info`
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
