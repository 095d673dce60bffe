//! # Local Store Errors
//!
//! ```text
//!   sqlx::Error ─┐
//!   MigrateError ┼──► DbError ──► SyncError::DatabaseError (till-sync)
//!   serde_json  ─┤
//!   CoreError   ─┘   (stored text that no longer decodes)
//! ```

use thiserror::Error;
use till_core::CoreError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A unique index rejected the write: a second entry with an existing
    /// idempotency token, or a server id another replica already owns.
    #[error("Duplicate value for {constraint}")]
    UniqueViolation { constraint: String },

    /// Another connection held the write lock past the busy timeout.
    #[error("Database is locked")]
    Locked,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A JSON column or enum text column holds something this build cannot
    /// read back.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Maps the message of a SQLite-reported failure.
    fn from_sqlite_message(message: &str) -> Self {
        const UNIQUE: &str = "UNIQUE constraint failed: ";

        if let Some(idx) = message.find(UNIQUE) {
            DbError::UniqueViolation {
                constraint: message[idx + UNIQUE.len()..].to_string(),
            }
        } else if message.contains("database is locked") {
            DbError::Locked
        } else {
            DbError::QueryFailed(message.to_string())
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Row", "query"),
            sqlx::Error::Database(db_err) => DbError::from_sqlite_message(db_err.message()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".into()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DbError::Corrupt(err.to_string())
            }
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

impl From<CoreError> for DbError {
    fn from(err: CoreError) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecodable_enum_text_is_corrupt() {
        let err: DbError = CoreError::unknown("mutation status", "archived").into();
        assert!(matches!(err, DbError::Corrupt(_)));
        assert!(err.to_string().contains("archived"));
    }

    #[test]
    fn missing_row_is_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[test]
    fn sqlite_messages_are_classified() {
        let unique =
            DbError::from_sqlite_message("UNIQUE constraint failed: mutation_log.idempotency_token");
        match unique {
            DbError::UniqueViolation { constraint } => {
                assert_eq!(constraint, "mutation_log.idempotency_token")
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            DbError::from_sqlite_message("database is locked"),
            DbError::Locked
        ));
        assert!(matches!(
            DbError::from_sqlite_message("no such table: nope"),
            DbError::QueryFailed(_)
        ));
    }
}
