//! # Cache Keys and TTL Classes
//!
//! Read results are cached per (path, store, normalized params). How long an
//! entry lives depends on what kind of data the path serves.
//!
//! ## TTL Classes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Class      Paths                                   Default TTL         │
//! │  ─────────  ──────────────────────────────────────  ───────────         │
//! │  Catalog    /products /categories /customers         1 hour             │
//! │             /catalog                                                    │
//! │  Stock      /inventory /stock                        5 minutes          │
//! │  Standard   everything else                          15 minutes         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Cache Key
// =============================================================================

/// Unique key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Normalized resource path (leading slash, no trailing slash).
    pub path: String,
    pub store_id: String,
    /// Query parameters sorted by name, encoded as `a=1&b=2`.
    pub params: String,
}

impl CacheKey {
    /// Builds a key, normalizing the path and the parameter order.
    ///
    /// ## Example
    /// ```rust
    /// use till_core::cache::CacheKey;
    ///
    /// let a = CacheKey::new("/products/", "s1", &[("page", "2"), ("q", "asp")]);
    /// let b = CacheKey::new("products", "s1", &[("q", "asp"), ("page", "2")]);
    /// assert_eq!(a, b);
    /// assert_eq!(a.params, "page=2&q=asp");
    /// ```
    pub fn new(path: &str, store_id: impl Into<String>, params: &[(&str, &str)]) -> Self {
        let mut pairs: Vec<(&str, &str)> = params.to_vec();
        pairs.sort();

        let params = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        CacheKey {
            path: normalize_path(path),
            store_id: store_id.into(),
            params,
        }
    }

    /// Returns the TTL class of this key's path.
    pub fn class(&self) -> CacheClass {
        CacheClass::for_path(&self.path)
    }
}

/// Ensures a single leading slash and strips trailing slashes.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{}", trimmed)
}

// =============================================================================
// Cache Class
// =============================================================================

/// Resource class that selects a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    /// Slow-changing reference data.
    Catalog,
    /// Stock levels; change with every sale.
    Stock,
    Standard,
}

const CATALOG_PREFIXES: &[&str] = &["/products", "/categories", "/customers", "/catalog"];
const STOCK_PREFIXES: &[&str] = &["/inventory", "/stock"];

impl CacheClass {
    /// Classifies a path by its leading segment.
    pub fn for_path(path: &str) -> Self {
        let path = normalize_path(path);
        if STOCK_PREFIXES.iter().any(|p| path_has_prefix(&path, p)) {
            CacheClass::Stock
        } else if CATALOG_PREFIXES.iter().any(|p| path_has_prefix(&path, p)) {
            CacheClass::Catalog
        } else {
            CacheClass::Standard
        }
    }
}

/// Returns true if `path` starts with `prefix`.
///
/// Matching is textual, the same as the store's prefix invalidation, so
/// `/stock` also matches `/stock-levels`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    path.starts_with(prefix)
}

// =============================================================================
// Cache Policy
// =============================================================================

/// TTL per cache class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub catalog_ttl: Duration,
    pub stock_ttl: Duration,
    pub standard_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            catalog_ttl: Duration::hours(1),
            stock_ttl: Duration::minutes(5),
            standard_ttl: Duration::minutes(15),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::Catalog => self.catalog_ttl,
            CacheClass::Stock => self.stock_ttl,
            CacheClass::Standard => self.standard_ttl,
        }
    }

    /// Builds an entry for `key` cached at `now`.
    pub fn entry(&self, key: CacheKey, value: Value, now: DateTime<Utc>) -> CacheEntry {
        let ttl = self.ttl_for(key.class());
        CacheEntry {
            key,
            value,
            cached_at: now,
            expires_at: now + ttl,
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is expired from `expires_at` onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
