//! Worker-level error type and transient classification

use thiserror::Error;
use vault_storage::StorageError;

use crate::crypto::CryptoError;
use crate::retry::HttpClientError;

/// Errors that can escape a heartbeat cycle to the supervisor
///
/// Per-entry and per-user failures never reach this type; they are logged
/// and the cycle continues. Whatever does arrive here either aborts the run
/// or, when transient, triggers one of the supervisor's bounded retries.
#[derive(Error, Debug)]
pub enum HeartbeatError {
    /// Missing or invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Datastore failure on an operation the cycle cannot continue without
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Provider HTTP failure that propagated out of a pass
    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// Server-secret material could not be used at all
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl HeartbeatError {
    /// Whether the supervisor may re-run the whole cycle over this error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Http(e) => e.is_transient(),
            Self::Config(_) | Self::Crypto(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_terminal() {
        let err = HeartbeatError::Config("missing SERVER_SECRET".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_storage_errors_propagate_class() {
        let err = HeartbeatError::Storage(StorageError::Api {
            status: 503,
            body: String::new(),
        });
        assert!(err.is_transient());
    }
}
