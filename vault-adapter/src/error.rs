//! Error types for both storage tiers and the adapter that joins them.
//!
//! Responsibilities:
//! - `StorageError` is what the primary (embedded) graph store reports.
//! - `VaultError` is what the remote vault client reports; it knows which failures are
//!   worth retrying.
//! - `AdapterError` is what callers of `DualStorageAdapter` see. Primary errors are carried
//!   through unchanged via `#[error(transparent)]`.

use thiserror::Error;

/// Error type for primary storage backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Raised only by the dual-storage adapter when a strict remote write fails after the
    /// primary write succeeded.
    #[error("Remote tier error: {0}")]
    Remote(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Error type for the remote vault tier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Vault request timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("Vault API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("Vault authentication failed: {0}")]
    AuthenticationError(String),
    #[error("Archive not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    /// Connection failures, timeouts, 5xx and 429 are transient. Everything else is a
    /// verdict from the vault that will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::ConnectionError(_) | VaultError::Timeout { .. } => true,
            VaultError::ApiError { status, .. } => *status >= 500 || *status == 429,
            VaultError::AuthenticationError(_)
            | VaultError::NotFound(_)
            | VaultError::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

/// Errors surfaced by `DualStorageAdapter`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error(transparent)]
    Primary(#[from] StorageError),
    #[error("Remote vault error: {0}")]
    Remote(#[from] VaultError),
    #[error("Invalid storage configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("Archival queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },
    #[error("Archival of session {session_id} failed permanently after {attempts} attempts")]
    RetriesExhausted { session_id: String, attempts: u32 },
    #[error("Archival is disabled for this adapter")]
    ArchivalDisabled,
    #[error("Adapter is shutting down")]
    ShuttingDown,
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        AdapterError::Io(e.to_string())
    }
}

impl AdapterError {
    /// Narrow to the primary storage contract. Primary errors come back unchanged.
    pub fn into_storage_error(self) -> StorageError {
        match self {
            AdapterError::Primary(e) => e,
            other => StorageError::Remote(other.to_string()),
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VaultError::ConnectionError("refused".into()).is_retryable());
        assert!(VaultError::Timeout { seconds: 30 }.is_retryable());
        assert!(VaultError::ApiError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(VaultError::ApiError {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!VaultError::ApiError {
            status: 400,
            message: "bad entry".into()
        }
        .is_retryable());
        assert!(!VaultError::AuthenticationError("bad key".into()).is_retryable());
    }

    #[test]
    fn test_primary_error_is_transparent() {
        let err: AdapterError = StorageError::NotFound("node-1".into()).into();
        assert_eq!(err.to_string(), "Not found: node-1");
        assert_eq!(err, AdapterError::Primary(StorageError::NotFound("node-1".into())));
    }

    #[test]
    fn test_into_storage_error_keeps_primary_errors() {
        let primary = AdapterError::Primary(StorageError::Backend("disk full".into()));
        assert_eq!(
            primary.into_storage_error(),
            StorageError::Backend("disk full".into())
        );
        let remote = AdapterError::Remote(VaultError::Timeout { seconds: 5 });
        assert_eq!(
            remote.into_storage_error(),
            StorageError::Remote("Remote vault error: Vault request timed out after 5s".into())
        );
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = AdapterError::InvalidConfig(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid storage configuration: a; b");
    }
}
