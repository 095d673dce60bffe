//! # till-core: Pure Sync Algorithms for Till
//!
//! This crate holds every part of the offline-first sync engine that can be
//! expressed without I/O: the operation and change types, the queue
//! collapse rules, the timeline merge, cache keys, and the invalidation map.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Till Sync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 till-sync (engine, network calls)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ till-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────────┐  │   │
//! │  │   │   types   │  │ collapse  │  │ timeline  │  │   cache    │  │   │
//! │  │   │ Mutation  │  │  rules    │  │  merge    │  │ keys, TTL  │  │   │
//! │  │   │ Replica   │  │           │  │           │  │ invalidate │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    till-db (Database Layer)                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Mutation log entries, replicas, checkpoints
//! - [`request`] - Structured replay requests and reference resolution
//! - [`changes`] - Server change feed records
//! - [`collapse`] - Queue collapse rules
//! - [`timeline`] - Chronological merge of server and local items
//! - [`cache`] - Cache keys, TTL classes, entries
//! - [`invalidation`] - Which cache prefixes a change affects
//! - [`state`] - Published sync state
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use till_core::collapse::collapse;
//! use till_core::request::ReplayRequest;
//! use till_core::types::{HttpMethod, LocalId, MutationKind, NewMutation, ResourceKind};
//!
//! let draft = LocalId::generate();
//! let create = NewMutation::new(
//!     "store-1",
//!     ResourceKind::Sale,
//!     draft.as_str(),
//!     MutationKind::Create,
//!     ReplayRequest::new(HttpMethod::Post, "/sales"),
//! );
//! assert!(create.idempotency_token.len() > 0);
//! assert!(collapse(Vec::new()).kept.is_empty());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod changes;
pub mod collapse;
pub mod error;
pub mod invalidation;
pub mod request;
pub mod state;
pub mod timeline;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cache::{CacheClass, CacheEntry, CacheKey, CachePolicy};
pub use changes::{AncillaryEvent, ChangeSet, RecordChange, ServerChange, StockMovementChange};
pub use collapse::{collapse, Collapsed, CollapseRule, DroppedEntry, COLLAPSE_RULES};
pub use error::{CoreError, CoreResult};
pub use request::{BodyRef, IdResolver, PathSegment, ReplayRequest, ResolvedRequest};
pub use state::{SyncSnapshot, SyncStatus};
pub use timeline::{interleave, Origin, TimelineItem};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Prefix of client-assigned placeholder ids.
///
/// A resource id carrying this prefix has never been confirmed by the
/// server and must be substituted before it appears in a replayed request.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Response field holding the server-assigned id of a created resource.
pub const SERVER_ID_FIELD: &str = "id";
