//! # Error Types
//!
//! Domain-specific error types for till-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  till-core errors (this file)                                          │
//! │  └── CoreError        - Reference resolution, value parsing            │
//! │                                                                         │
//! │  till-db errors (separate crate)                                       │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  till-sync errors (separate crate)                                     │
//! │  └── SyncError        - Transport, rejection, configuration            │
//! │                                                                         │
//! │  Flow: CoreError → DbError / SyncError → caller                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core errors raised by the pure sync algorithms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A request references a placeholder id that has no server mapping.
    ///
    /// ## When This Occurs
    /// - The create that would have assigned the id was rejected
    /// - The create was cancelled by a later delete
    #[error("Unresolved local reference: {local_id}")]
    UnresolvedReference { local_id: String },

    /// A body reference points at a location that does not hold a string id.
    #[error("Body reference {pointer} does not point at an id")]
    InvalidBodyRef { pointer: String },

    /// A stored enum value could not be parsed.
    #[error("Unknown {field} value: '{value}'")]
    UnknownValue { field: String, value: String },
}

impl CoreError {
    /// Creates an UnknownValue error.
    pub fn unknown(field: impl Into<String>, value: impl Into<String>) -> Self {
        CoreError::UnknownValue {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
