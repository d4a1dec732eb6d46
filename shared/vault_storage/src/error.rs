//! Error types for datastore operations

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to the datastore
#[derive(Error, Debug)]
pub enum StorageError {
    /// Transport-level failure (connect, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The datastore answered with a non-success status
    #[error("datastore error: status {status}: {body}")]
    Api {
        /// HTTP status code of the response
        status: u16,
        /// Response body, truncated by the caller where needed
        body: String,
    },

    /// The datastore answered 2xx but the payload did not parse
    #[error("unexpected response shape: {0}")]
    Malformed(String),

    /// Client-side configuration problem (bad base URL, empty key)
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the outer supervisor may retry the whole cycle over this error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => {
                matches!(*status, 408 | 425 | 429) || *status >= 500
            }
            Self::Malformed(_) | Self::Config(_) => false,
        }
    }
}
