//! # Mutation Log Repository
//!
//! Durable queue of local writes that have not been confirmed by the server.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► PENDING ──mark_attempted──► PENDING (attempted_at set)    │
//! │                 │                            │                          │
//! │                 │        record_transient_error (attempts += 1)        │
//! │                 │                            │                          │
//! │                 ├──── mark_done ────────────►├──► DONE                 │
//! │                 ├──── mark_collapsed ───────►│    (never sent)         │
//! │                 └──── mark_failed ──────────►└──► FAILED               │
//! │                                                      │                  │
//! │                                              clear_failed (operator)   │
//! │                                                                         │
//! │  Replay order: (created_at, id) ascending.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};
use till_core::{DroppedEntry, MutationLogEntry, MutationStatus, NewMutation, ReplayRequest};

#[derive(sqlx::FromRow)]
struct MutationRow {
    id: i64,
    idempotency_token: String,
    store_id: String,
    resource_kind: String,
    resource_id: String,
    kind: String,
    request: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: i64,
    attempted_at: Option<i64>,
}

impl MutationRow {
    fn into_entry(self) -> DbResult<MutationLogEntry> {
        Ok(MutationLogEntry {
            id: self.id,
            idempotency_token: self.idempotency_token,
            store_id: self.store_id,
            resource_kind: self.resource_kind.parse()?,
            resource_id: self.resource_id,
            kind: self.kind.parse()?,
            request: serde_json::from_str(&self.request)?,
            status: self.status.parse()?,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            attempted_at: self.attempted_at.map(from_millis).transpose()?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, idempotency_token, store_id, resource_kind, resource_id, kind,
           request, status, attempts, last_error, created_at, attempted_at
    FROM mutation_log
"#;

/// Entry counts of one store by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub done: i64,
    pub failed: i64,
}

/// Repository for the mutation log.
#[derive(Debug, Clone)]
pub struct MutationLogRepository {
    pool: SqlitePool,
}

impl MutationLogRepository {
    /// Creates a new MutationLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MutationLogRepository { pool }
    }

    /// Appends a pending entry stamped with the current time.
    ///
    /// ## Errors
    /// `UniqueViolation` if an entry with the same idempotency token exists.
    pub async fn enqueue(&self, mutation: &NewMutation) -> DbResult<MutationLogEntry> {
        self.enqueue_at(mutation, Utc::now()).await
    }

    /// Appends a pending entry with an explicit enqueue time.
    pub async fn enqueue_at(
        &self,
        mutation: &NewMutation,
        created_at: DateTime<Utc>,
    ) -> DbResult<MutationLogEntry> {
        let request = serde_json::to_string(&mutation.request)?;

        let result = sqlx::query(
            r#"
            INSERT INTO mutation_log (
                idempotency_token, store_id, resource_kind, resource_id, kind,
                request, status, attempts, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)
            "#,
        )
        .bind(&mutation.idempotency_token)
        .bind(&mutation.store_id)
        .bind(mutation.resource_kind.as_str())
        .bind(&mutation.resource_id)
        .bind(mutation.kind.as_str())
        .bind(&request)
        .bind(to_millis(created_at))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();

        info!(
            store_id = %mutation.store_id,
            token = %mutation.idempotency_token,
            kind = %mutation.kind,
            resource_id = %mutation.resource_id,
            "Mutation enqueued"
        );

        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("MutationLogEntry", id.to_string()))
    }

    /// Gets one entry by row id.
    pub async fn get(&self, id: i64) -> DbResult<Option<MutationLogEntry>> {
        let row = sqlx::query_as::<_, MutationRow>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(MutationRow::into_entry).transpose()
    }

    /// Gets an entry by idempotency token.
    pub async fn get_by_token(&self, token: &str) -> DbResult<Option<MutationLogEntry>> {
        let row = sqlx::query_as::<_, MutationRow>(&format!(
            "{SELECT_COLUMNS} WHERE idempotency_token = ?1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MutationRow::into_entry).transpose()
    }

    /// Pending entries of a store in replay order.
    pub async fn get_pending(&self, store_id: &str) -> DbResult<Vec<MutationLogEntry>> {
        self.by_status(store_id, MutationStatus::Pending).await
    }

    /// Failed entries of a store with their last error, oldest first.
    pub async fn failed_entries(&self, store_id: &str) -> DbResult<Vec<MutationLogEntry>> {
        self.by_status(store_id, MutationStatus::Failed).await
    }

    async fn by_status(&self, store_id: &str, status: MutationStatus) -> DbResult<Vec<MutationLogEntry>> {
        let rows = sqlx::query_as::<_, MutationRow>(&format!(
            "{SELECT_COLUMNS} WHERE status = ?1 AND store_id = ?2 ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MutationRow::into_entry).collect()
    }

    /// Returns true if the store has anything waiting to be replayed.
    pub async fn has_pending(&self, store_id: &str) -> DbResult<bool> {
        Ok(self.count_by_status(store_id).await?.pending > 0)
    }

    /// Records that the entry is about to be handed to the transport.
    ///
    /// Only the first attempt is kept; from then on the server may have seen it.
    pub async fn mark_attempted(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE mutation_log SET attempted_at = COALESCE(attempted_at, ?2) WHERE id = ?1")
            .bind(id)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Marks an entry as confirmed by the server.
    pub async fn mark_done(&self, id: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_log SET
                status = 'done',
                attempts = attempts + 1,
                last_error = NULL,
                completed_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(id, "Mutation done");
        Ok(())
    }

    /// Marks an entry as permanently rejected. It is never retried.
    pub async fn mark_failed(&self, id: i64, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_log SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = ?2,
                completed_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(id, error = %error, "Mutation failed");
        Ok(())
    }

    /// Records a transient failure; the entry stays pending.
    pub async fn record_transient_error(&self, id: i64, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_log SET
                attempts = attempts + 1,
                last_error = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Marks entries removed by collapse as done without a network call.
    pub async fn mark_collapsed(&self, dropped: &[DroppedEntry]) -> DbResult<()> {
        if dropped.is_empty() {
            return Ok(());
        }

        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for entry in dropped {
            sqlx::query(
                r#"
                UPDATE mutation_log SET
                    status = 'done',
                    last_error = ?2,
                    completed_at = ?3
                WHERE id = ?1 AND status = 'pending'
                "#,
            )
            .bind(entry.id)
            .bind(format!("collapsed: {}", entry.rule))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = dropped.len(), "Collapsed entries marked done");
        Ok(())
    }

    /// Replaces the stored request of a pending entry.
    pub async fn update_request(&self, id: i64, request: &ReplayRequest) -> DbResult<()> {
        sqlx::query("UPDATE mutation_log SET request = ?2 WHERE id = ?1 AND status = 'pending'")
            .bind(id)
            .bind(serde_json::to_string(request)?)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Removes every failed entry of a store without retrying it.
    pub async fn clear_failed(&self, store_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM mutation_log WHERE status = 'failed' AND store_id = ?1")
            .bind(store_id)
            .execute(&self.pool)
            .await?;

        info!(store_id = %store_id, removed = result.rows_affected(), "Failed mutations cleared");
        Ok(result.rows_affected())
    }

    /// Entry counts of a store by status.
    pub async fn count_by_status(&self, store_id: &str) -> DbResult<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM mutation_log WHERE store_id = ?1 GROUP BY status",
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.parse::<MutationStatus>()? {
                MutationStatus::Pending => counts.pending = count,
                MutationStatus::Done => counts.done = count,
                MutationStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Deletes done entries completed more than `days_old` days ago.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn cleanup_completed(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_old));
        let result = sqlx::query(
            "DELETE FROM mutation_log WHERE status = 'done' AND completed_at < ?1",
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::db;
    use chrono::TimeZone;
    use serde_json::json;
    use till_core::{CollapseRule, HttpMethod, MutationKind, ResourceKind};

    fn mutation(resource_id: &str, kind: MutationKind) -> NewMutation {
        NewMutation::new(
            "s1",
            ResourceKind::Sale,
            resource_id,
            kind,
            ReplayRequest::new(HttpMethod::Post, "/sales").with_body(json!({ "total": 10 })),
        )
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_get_pending_in_order() {
        let repo = db().await.mutations();
        let late = repo.enqueue_at(&mutation("local-b", MutationKind::Create), at(5)).await.unwrap();
        let early = repo.enqueue_at(&mutation("local-a", MutationKind::Create), at(1)).await.unwrap();
        let tie = repo.enqueue_at(&mutation("local-c", MutationKind::Create), at(5)).await.unwrap();

        let pending = repo.get_pending("s1").await.unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, late.id, tie.id]);
        assert_eq!(pending[0].request.body, Some(json!({ "total": 10 })));
        assert!(pending[0].is_unsent());
        assert!(repo.get_pending("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let repo = db().await.mutations();
        let m = mutation("local-a", MutationKind::Create);
        repo.enqueue(&m).await.unwrap();
        assert!(matches!(
            repo.enqueue(&m).await,
            Err(DbError::UniqueViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let repo = db().await.mutations();
        let a = repo.enqueue(&mutation("local-a", MutationKind::Create)).await.unwrap();
        let b = repo.enqueue(&mutation("local-b", MutationKind::Create)).await.unwrap();
        let c = repo.enqueue(&mutation("local-c", MutationKind::Create)).await.unwrap();

        repo.mark_attempted(a.id).await.unwrap();
        repo.mark_done(a.id).await.unwrap();
        repo.mark_failed(b.id, "422: invalid total").await.unwrap();
        repo.record_transient_error(c.id, "503").await.unwrap();

        let a = repo.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, MutationStatus::Done);
        assert_eq!(a.attempts, 1);
        assert!(a.attempted_at.is_some());

        let failed = repo.failed_entries("s1").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("422: invalid total"));

        let c = repo.get(c.id).await.unwrap().unwrap();
        assert_eq!(c.status, MutationStatus::Pending);
        assert_eq!(c.attempts, 1);

        assert_eq!(
            repo.count_by_status("s1").await.unwrap(),
            StatusCounts { pending: 1, done: 1, failed: 1 }
        );
    }

    #[tokio::test]
    async fn test_clear_failed_does_not_retry() {
        let repo = db().await.mutations();
        let a = repo.enqueue(&mutation("local-a", MutationKind::Create)).await.unwrap();
        repo.mark_failed(a.id, "404").await.unwrap();

        assert_eq!(repo.clear_failed("s1").await.unwrap(), 1);
        assert!(repo.get(a.id).await.unwrap().is_none());
        assert!(repo.get_pending("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_collapsed_and_update_request() {
        let repo = db().await.mutations();
        let a = repo.enqueue(&mutation("local-a", MutationKind::Create)).await.unwrap();
        let b = repo.enqueue(&mutation("local-a", MutationKind::Create)).await.unwrap();

        repo.mark_collapsed(&[DroppedEntry {
            id: b.id,
            idempotency_token: b.idempotency_token.clone(),
            rule: CollapseRule::SingleCreatePerPlaceholder,
        }])
        .await
        .unwrap();

        let merged = ReplayRequest::new(HttpMethod::Post, "/sales").with_body(json!({ "total": 12 }));
        repo.update_request(a.id, &merged).await.unwrap();

        let pending = repo.get_pending("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request, merged);

        let b = repo.get_by_token(&b.idempotency_token).await.unwrap().unwrap();
        assert_eq!(b.status, MutationStatus::Done);
        assert_eq!(b.attempts, 0);
    }

    #[tokio::test]
    async fn test_cleanup_completed_keeps_recent() {
        let repo = db().await.mutations();
        let a = repo.enqueue(&mutation("local-a", MutationKind::Create)).await.unwrap();
        repo.mark_done(a.id).await.unwrap();
        assert_eq!(repo.cleanup_completed(7).await.unwrap(), 0);
        assert!(repo.get(a.id).await.unwrap().is_some());
    }
}
