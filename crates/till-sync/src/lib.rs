//! # till-sync: Sync Engine for Till
//!
//! Keeps a point-of-sale terminal working while the server is unreachable
//! and reconciles both histories once it is back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncAgent (one per terminal)                    │  │
//! │  │  triggers: reconnect / manual / login / interval                │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ one per store                          │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        SyncEngine                                │  │
//! │  │                                                                  │  │
//! │  │   ChangePuller ──► collapse ──► interleave ──► MutationExecutor  │  │
//! │  │   (changes since)   (queue)     (timeline)     (one call/op)     │  │
//! │  │                                                                  │  │
//! │  │   StatePublisher ◄── pending / failed / status after each pass   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                               ▲                                         │
//! │  ┌────────────────────────────┴─────────────────────────────────────┐  │
//! │  │  Gateway: submit (send now or defer) and cache-through read     │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  SyncTransport ─ HttpTransport (reqwest) or an in-process fake          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Every operation carries one idempotency token for its whole life
//! - Items of a pass are applied in timestamp order across both origins
//! - A transient failure aborts the pass and leaves the checkpoint alone
//! - A permanent rejection fails only the operation that caused it
//! - At most one pass per store is in flight
//!
//! ## Modules
//!
//! - [`agent`] - Multi-store agent and triggers
//! - [`engine`] - The sync pass
//! - [`gateway`] - Submit and read
//! - [`executor`] - One replay call
//! - [`puller`] - Changes-since pull
//! - [`publisher`] - Observable sync state
//! - [`transport`] - HTTP seam
//! - [`config`] - Configuration
//! - [`error`] - Error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod publisher;
pub mod puller;
pub mod transport;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use agent::{SyncAgent, SyncAgentHandle, SyncTrigger};
pub use config::SyncConfig;
pub use engine::{Connectivity, PassOutcome, PassReport, StepRecord, SyncEngine};
pub use error::{SyncError, SyncResult, TransportError};
pub use executor::{ExecutionOutcome, MutationExecutor};
pub use gateway::{Gateway, ReadOutcome, Submission};
pub use publisher::{NoOpObserver, StatePublisher, SubscriptionId, SyncStateObserver};
pub use puller::ChangePuller;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, SyncTransport};
