//! # Cache Repository
//!
//! Read-through cache rows keyed by (path, store, normalized params).
//!
//! ## Expiry
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  read(key)                                                              │
//! │    ├── no row              → None                                      │
//! │    ├── now >= expires_at   → DELETE row, None                          │
//! │    └── otherwise           → Some(entry)                               │
//! │                                                                         │
//! │  invalidate_by_prefixes(["/inventory", "/stock"], store)               │
//! │    → DELETE rows of that store whose path starts with any prefix       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_millis, to_millis};
use crate::error::DbResult;
use till_core::{CacheEntry, CacheKey, CachePolicy};

#[derive(sqlx::FromRow)]
struct CacheRow {
    path: String,
    store_id: String,
    params: String,
    value: String,
    cached_at: i64,
    expires_at: i64,
}

impl CacheRow {
    fn into_entry(self) -> DbResult<CacheEntry> {
        Ok(CacheEntry {
            key: CacheKey {
                path: self.path,
                store_id: self.store_id,
                params: self.params,
            },
            value: serde_json::from_str(&self.value)?,
            cached_at: from_millis(self.cached_at)?,
            expires_at: from_millis(self.expires_at)?,
        })
    }
}

/// Repository for cached read results.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
}

impl CacheRepository {
    /// Creates a new CacheRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CacheRepository { pool }
    }

    /// Upserts `value` under `key` with the TTL of the key's class.
    pub async fn write(&self, key: &CacheKey, value: &Value, policy: &CachePolicy) -> DbResult<CacheEntry> {
        let entry = policy.entry(key.clone(), value.clone(), Utc::now());
        self.put(&entry).await?;
        Ok(entry)
    }

    /// Upserts a fully built entry.
    pub async fn put(&self, entry: &CacheEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (path, store_id, params, value, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (path, store_id, params) DO UPDATE SET
                value = excluded.value,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.key.path)
        .bind(&entry.key.store_id)
        .bind(&entry.key.params)
        .bind(entry.value.to_string())
        .bind(to_millis(entry.cached_at))
        .bind(to_millis(entry.expires_at))
        .execute(&self.pool)
        .await?;

        debug!(path = %entry.key.path, store_id = %entry.key.store_id, "Cache entry written");
        Ok(())
    }

    /// Returns the entry if it is unexpired; an expired entry is removed.
    pub async fn read(&self, key: &CacheKey) -> DbResult<Option<CacheEntry>> {
        self.read_at(key, Utc::now()).await
    }

    /// [`read`](Self::read) with an explicit clock.
    pub async fn read_at(&self, key: &CacheKey, now: DateTime<Utc>) -> DbResult<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT path, store_id, params, value, cached_at, expires_at
            FROM cache_entries
            WHERE path = ?1 AND store_id = ?2 AND params = ?3
            "#,
        )
        .bind(&key.path)
        .bind(&key.store_id)
        .bind(&key.params)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if now >= from_millis(row.expires_at)? {
            // Only delete the row we saw; a concurrent write may have refreshed it.
            sqlx::query(
                r#"
                DELETE FROM cache_entries
                WHERE path = ?1 AND store_id = ?2 AND params = ?3 AND expires_at <= ?4
                "#,
            )
            .bind(&key.path)
            .bind(&key.store_id)
            .bind(&key.params)
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;

            debug!(path = %key.path, store_id = %key.store_id, "Expired cache entry removed");
            return Ok(None);
        }

        row.into_entry().map(Some)
    }

    /// Removes every entry of `store_id` whose path starts with any prefix.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn invalidate_by_prefixes(&self, prefixes: &[&str], store_id: &str) -> DbResult<u64> {
        if prefixes.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for prefix in prefixes {
            let result = sqlx::query(
                r#"
                DELETE FROM cache_entries
                WHERE store_id = ?1 AND substr(path, 1, length(?2)) = ?2
                "#,
            )
            .bind(store_id)
            .bind(*prefix)
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;

        debug!(store_id = %store_id, ?prefixes, removed, "Cache invalidated");
        Ok(removed)
    }

    /// Deletes every expired entry.
    pub async fn purge_expired(&self) -> DbResult<u64> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Counts entries of a store, expired or not.
    pub async fn count(&self, store_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE store_id = ?1")
            .bind(store_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::db;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let repo = db().await.cache();
        let key = CacheKey::new("/products", "s1", &[("page", "1")]);

        repo.write(&key, &json!([{ "id": "p1" }]), &CachePolicy::default())
            .await
            .unwrap();

        let entry = repo.read(&key).await.unwrap().unwrap();
        assert_eq!(entry.value, json!([{ "id": "p1" }]));

        let other_store = CacheKey::new("/products", "s2", &[("page", "1")]);
        assert!(repo.read(&other_store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let repo = db().await.cache();
        let key = CacheKey::new("/inventory", "s1", &[]);
        let t0 = Utc::now();
        repo.put(&CachePolicy::default().entry(key.clone(), json!(5), t0))
            .await
            .unwrap();

        assert!(repo.read_at(&key, t0 + Duration::minutes(4)).await.unwrap().is_some());
        assert!(repo.read_at(&key, t0 + Duration::minutes(6)).await.unwrap().is_none());
        assert_eq!(repo.count("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_prefixes_scoped_to_store() {
        let repo = db().await.cache();
        let policy = CachePolicy::default();
        for (path, store) in [
            ("/inventory", "s1"),
            ("/inventory/p1", "s1"),
            ("/stock/levels", "s1"),
            ("/products", "s1"),
            ("/inventory", "s2"),
        ] {
            repo.write(&CacheKey::new(path, store, &[]), &json!(1), &policy)
                .await
                .unwrap();
        }

        let removed = repo
            .invalidate_by_prefixes(&["/inventory", "/stock"], "s1")
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(repo.count("s1").await.unwrap(), 1);
        assert_eq!(repo.count("s2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let repo = db().await.cache();
        let policy = CachePolicy::default();
        let t0 = Utc::now();
        repo.put(&policy.entry(CacheKey::new("/stock", "s1", &[]), json!(1), t0))
            .await
            .unwrap();
        repo.put(&policy.entry(CacheKey::new("/products", "s1", &[]), json!(1), t0))
            .await
            .unwrap();

        let purged = repo.purge_expired_at(t0 + Duration::minutes(10)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(repo.count("s1").await.unwrap(), 1);
    }
}
