//! # Repository Module
//!
//! One repository per record type owned by the local store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who Uses What                                        │
//! │                                                                         │
//! │  Gateway (foreground)        Pass (background, per store)              │
//! │  ├── cache().read/write      ├── mutations().get_pending               │
//! │  └── mutations().enqueue     ├── mutations().mark_done / mark_failed   │
//! │                              ├── replicas().record_confirmed           │
//! │                              ├── replicas().upsert_from_server         │
//! │                              ├── cache().invalidate_by_prefixes        │
//! │                              └── checkpoints().advance                 │
//! │                                                                         │
//! │  Every write is a single statement or one short transaction, so a     │
//! │  concurrent reader never observes a partial record.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`cache::CacheRepository`] - Read cache with lazy expiry
//! - [`mutation_log::MutationLogRepository`] - Durable mutation queue
//! - [`replica::ReplicaRepository`] - Local replicas and id mapping
//! - [`checkpoint::CheckpointRepository`] - Per-store pull checkpoints

pub mod cache;
pub mod checkpoint;
pub mod mutation_log;
pub mod replica;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{DbError, DbResult};

/// Timestamps are stored as integer milliseconds so SQL ordering is exact.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::Corrupt(format!("timestamp out of range: {ms}")))
}
