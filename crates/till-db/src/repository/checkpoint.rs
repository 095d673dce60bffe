//! # Checkpoint Repository
//!
//! One "changes since" lower bound per store. The stored value only moves
//! forward: an advance to an earlier or equal time is ignored.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use super::{from_millis, to_millis};
use crate::error::DbResult;
use till_core::SyncCheckpoint;

/// Repository for per-store sync checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    /// Creates a new CheckpointRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CheckpointRepository { pool }
    }

    /// Returns the checkpoint of a store; None means pull all history.
    pub async fn get(&self, store_id: &str) -> DbResult<Option<SyncCheckpoint>> {
        let since: Option<i64> = sqlx::query_scalar("SELECT since FROM sync_checkpoints WHERE store_id = ?1")
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await?;

        since
            .map(|ms| {
                Ok(SyncCheckpoint {
                    store_id: store_id.to_string(),
                    since: from_millis(ms)?,
                })
            })
            .transpose()
    }

    /// Moves the checkpoint forward to `since`.
    ///
    /// ## Returns
    /// true if the stored value changed.
    pub async fn advance(&self, store_id: &str, since: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (store_id, since) VALUES (?1, ?2)
            ON CONFLICT (store_id) DO UPDATE SET since = excluded.since
            WHERE excluded.since > sync_checkpoints.since
            "#,
        )
        .bind(store_id)
        .bind(to_millis(since))
        .execute(&self.pool)
        .await?;

        let advanced = result.rows_affected() > 0;
        if advanced {
            info!(store_id = %store_id, since = %since, "Checkpoint advanced");
        }
        Ok(advanced)
    }
}
