//! # Replica Repository
//!
//! Local copies of server-owned records, addressable by local id and, once
//! the server has created them, by server id.
//!
//! ## Dual-Key Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Created offline:    local_id = local-7f..   server_id = NULL          │
//! │  Create confirmed:   local_id = local-7f..   server_id = 1042          │
//! │  Pulled from server: local_id = 1042         server_id = 1042          │
//! │                                                                         │
//! │  Every row belongs to one store context. Server ids are unique per      │
//! │  store and resource kind; placeholders are unique within a store.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_millis, to_millis};
use crate::error::DbResult;
use till_core::{LocalReplicaRecord, ResourceKind};

#[derive(sqlx::FromRow)]
struct ReplicaRow {
    resource_kind: String,
    local_id: String,
    server_id: Option<String>,
    store_id: String,
    fields: String,
    updated_at: i64,
}

impl ReplicaRow {
    fn into_record(self) -> DbResult<LocalReplicaRecord> {
        Ok(LocalReplicaRecord {
            local_id: self.local_id,
            server_id: self.server_id,
            store_id: self.store_id,
            resource_kind: self.resource_kind.parse()?,
            fields: serde_json::from_str(&self.fields)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Repository for local replicas.
#[derive(Debug, Clone)]
pub struct ReplicaRepository {
    pool: SqlitePool,
}

impl ReplicaRepository {
    /// Creates a new ReplicaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReplicaRepository { pool }
    }

    /// Inserts or replaces a replica by local id within its store.
    ///
    /// A known server id is never cleared by a write that lacks one.
    pub async fn upsert_local(&self, record: &LocalReplicaRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_replicas (resource_kind, local_id, server_id, store_id, fields, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (store_id, resource_kind, local_id) DO UPDATE SET
                server_id = COALESCE(excluded.server_id, server_id),
                fields = excluded.fields,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.resource_kind.as_str())
        .bind(&record.local_id)
        .bind(&record.server_id)
        .bind(&record.store_id)
        .bind(record.fields.to_string())
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores the authoritative body returned for a confirmed local operation.
    ///
    /// With a placeholder `local_id` the replica gains its server id; a row
    /// of the same store that was pulled for that server id in the meantime
    /// is folded into it so the server id stays unique.
    pub async fn record_confirmed(
        &self,
        store_id: &str,
        kind: ResourceKind,
        local_id: Option<&str>,
        server_id: &str,
        fields: &Value,
    ) -> DbResult<()> {
        let Some(local_id) = local_id else {
            return self
                .upsert_from_server(store_id, kind, server_id, fields, Utc::now())
                .await;
        };

        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM local_replicas
            WHERE store_id = ?1 AND resource_kind = ?2 AND server_id = ?3 AND local_id <> ?4
            "#,
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(server_id)
        .bind(local_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO local_replicas (resource_kind, local_id, server_id, store_id, fields, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (store_id, resource_kind, local_id) DO UPDATE SET
                server_id = excluded.server_id,
                fields = excluded.fields,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(local_id)
        .bind(server_id)
        .bind(store_id)
        .bind(fields.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(store_id = %store_id, local_id = %local_id, server_id = %server_id, kind = %kind, "Replica confirmed");
        Ok(())
    }

    /// Applies a server-origin record: replaces the store's replica carrying
    /// `server_id`, or inserts one keyed by the server id.
    pub async fn upsert_from_server(
        &self,
        store_id: &str,
        kind: ResourceKind,
        server_id: &str,
        fields: &Value,
        updated_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE local_replicas SET fields = ?4, updated_at = ?5
            WHERE store_id = ?1 AND resource_kind = ?2 AND server_id = ?3
            "#,
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(server_id)
        .bind(fields.to_string())
        .bind(to_millis(updated_at))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO local_replicas (resource_kind, local_id, server_id, store_id, fields, updated_at)
                VALUES (?1, ?2, ?2, ?3, ?4, ?5)
                ON CONFLICT (store_id, resource_kind, local_id) DO UPDATE SET
                    server_id = excluded.server_id,
                    fields = excluded.fields,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(kind.as_str())
            .bind(server_id)
            .bind(store_id)
            .bind(fields.to_string())
            .bind(to_millis(updated_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Removes the store's replica carrying `server_id`.
    pub async fn remove_by_server_id(
        &self,
        store_id: &str,
        kind: ResourceKind,
        server_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "DELETE FROM local_replicas WHERE store_id = ?1 AND resource_kind = ?2 AND server_id = ?3",
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(server_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Removes a replica by local id.
    pub async fn remove_local(
        &self,
        store_id: &str,
        kind: ResourceKind,
        local_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "DELETE FROM local_replicas WHERE store_id = ?1 AND resource_kind = ?2 AND local_id = ?3",
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_by_local_id(
        &self,
        store_id: &str,
        kind: ResourceKind,
        local_id: &str,
    ) -> DbResult<Option<LocalReplicaRecord>> {
        let row = sqlx::query_as::<_, ReplicaRow>(
            r#"
            SELECT resource_kind, local_id, server_id, store_id, fields, updated_at
            FROM local_replicas
            WHERE store_id = ?1 AND resource_kind = ?2 AND local_id = ?3
            "#,
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReplicaRow::into_record).transpose()
    }

    pub async fn get_by_server_id(
        &self,
        store_id: &str,
        kind: ResourceKind,
        server_id: &str,
    ) -> DbResult<Option<LocalReplicaRecord>> {
        let row = sqlx::query_as::<_, ReplicaRow>(
            r#"
            SELECT resource_kind, local_id, server_id, store_id, fields, updated_at
            FROM local_replicas
            WHERE store_id = ?1 AND resource_kind = ?2 AND server_id = ?3
            "#,
        )
        .bind(store_id)
        .bind(kind.as_str())
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReplicaRow::into_record).transpose()
    }

    /// Server id assigned to one of the store's placeholders in an earlier
    /// pass, if any.
    pub async fn server_id_for(&self, store_id: &str, local_id: &str) -> DbResult<Option<String>> {
        let server_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT server_id FROM local_replicas
            WHERE store_id = ?1 AND local_id = ?2 AND server_id IS NOT NULL
            LIMIT 1
            "#,
        )
        .bind(store_id)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(server_id)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
