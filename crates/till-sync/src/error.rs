//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transient     │  │     Permanent           │ │
//! │  │                 │  │  (retry later)  │  │  (this op only)         │ │
//! │  │  InvalidConfig  │  │  Transport      │  │  PermanentRejection     │ │
//! │  │  InvalidUrl     │  │   ├ Connect     │  │   (4xx)                 │ │
//! │  │  ConfigLoad..   │  │   ├ Timeout     │  │  UnresolvedReference    │ │
//! │  │  UnknownStore   │  │   └ Request     │  │                         │ │
//! │  │                 │  │  TransientServer│  │                         │ │
//! │  │                 │  │   (5xx)         │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Database     │  │  Internal: ShuttingDown, ChannelError, ...  │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  A transient error aborts the whole pass; a permanent one fails only  │
//! │  the operation that caused it.                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use till_core::CoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// No response reached the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not connect (offline, DNS, refused).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request or the response did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The exchange broke off for another reason.
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// No engine is registered for the store.
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// No response reached us.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server answered 5xx (or anything that is neither 2xx nor 4xx).
    #[error("Server error {status}: {message}")]
    TransientServer { status: u16, message: String },

    // =========================================================================
    // Permanent Errors
    // =========================================================================
    /// The server rejected the operation with a 4xx. Never retried.
    #[error("Rejected by server ({status}): {message}")]
    PermanentRejection { status: u16, message: String },

    /// The operation references a placeholder that never got a server id.
    #[error("Unresolved reference: {local_id}")]
    UnresolvedReference { local_id: String },

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize a request.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A server response could not be decoded.
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<till_db::DbError> for SyncError {
    fn from(err: till_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnresolvedReference { local_id } => SyncError::UnresolvedReference { local_id },
            other => SyncError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.into())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Classifies a non-2xx HTTP status.
    ///
    /// ```text
    /// 400..=499 → PermanentRejection
    /// anything else → TransientServer
    /// ```
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            SyncError::PermanentRejection { status, message }
        } else {
            SyncError::TransientServer { status, message }
        }
    }

    /// Returns true if the operation may succeed on a later pass.
    ///
    /// ## Retryable Errors
    /// - Transport failures (offline, timeout)
    /// - 5xx responses
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::TransientServer { .. }
        )
    }

    /// Returns true if this error is terminal for a single operation.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncError::PermanentRejection { .. } | SyncError::UnresolvedReference { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::UnknownStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(SyncError::from_status(422, "bad total").is_permanent());
        assert!(SyncError::from_status(404, "gone").is_permanent());
        assert!(SyncError::from_status(503, "busy").is_retryable());
        assert!(SyncError::from_status(500, "").is_retryable());
        assert!(!SyncError::from_status(409, "conflict").is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Transport(TransportError::Timeout).is_retryable());
        assert!(SyncError::Transport(TransportError::Connect("refused".into())).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::DatabaseError("locked".into()).is_retryable());
        assert!(!SyncError::DatabaseError("locked".into()).is_permanent());
    }

    #[test]
    fn test_unresolved_reference_is_permanent() {
        let err: SyncError = CoreError::UnresolvedReference {
            local_id: "local-x".into(),
        }
        .into();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("local-x"));
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::UnknownStore("s9".into()).is_config_error());
        assert!(!SyncError::ShuttingDown.is_config_error());
    }
}
