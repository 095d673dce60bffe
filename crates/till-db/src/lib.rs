//! # till-db: Local Persistent Store for Till
//!
//! SQLite-backed storage for everything the sync engine keeps on the
//! terminal: read cache, mutation log, replicas and checkpoints.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Till Data Flow                                   │
//! │                                                                         │
//! │  till-sync (gateway, pass, publisher)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     till-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │                    │  │ (embedded) │  │   │
//! │  │   │               │    │ CacheRepository    │  │            │  │   │
//! │  │   │ SqlitePool    │◄───│ MutationLogRepo    │  │ 001_cache  │  │   │
//! │  │   │               │    │ ReplicaRepository  │  │ 002_log    │  │   │
//! │  │   │               │    │ CheckpointRepo     │  │ 003_repl.. │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database (till.db, WAL)                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use till_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/till.db")).await?;
//! let pending = db.mutations().get_pending("store-1").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cache::CacheRepository;
pub use repository::checkpoint::CheckpointRepository;
pub use repository::mutation_log::{MutationLogRepository, StatusCounts};
pub use repository::replica::ReplicaRepository;
