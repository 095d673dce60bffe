//! # Domain Types
//!
//! Records owned by the local persistent store.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Domain Types                               │
//! │                                                                         │
//! │  ┌──────────────────────┐  ┌──────────────────────┐                    │
//! │  │  MutationLogEntry    │  │  LocalReplicaRecord  │                    │
//! │  │  ──────────────────  │  │  ──────────────────  │                    │
//! │  │  idempotency_token   │  │  local_id (stable)   │                    │
//! │  │  resource_id         │  │  server_id (late)    │                    │
//! │  │  kind / request      │  │  fields (JSON)       │                    │
//! │  │  status / attempts   │  │  updated_at          │                    │
//! │  └──────────────────────┘  └──────────────────────┘                    │
//! │                                                                         │
//! │  ┌──────────────────────┐  ┌──────────────────────┐                    │
//! │  │  MutationKind        │  │  SyncCheckpoint      │                    │
//! │  │  Create/Update/Delete│  │  one per store       │                    │
//! │  │  + discrete events   │  │  monotonic `since`   │                    │
//! │  └──────────────────────┘  └──────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! A resource created offline gets a `local-…` placeholder id. Once the
//! server confirms the create, the replica also carries the server id and is
//! addressable by either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;
use crate::request::ReplayRequest;
use crate::LOCAL_ID_PREFIX;

// =============================================================================
// Resource Kind
// =============================================================================

/// The business resource an operation or change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Sale (draft or confirmed).
    Sale,
    /// Line item inside a sale.
    SaleItem,
    /// Cash register session.
    CashSession,
    /// Cash in/out movement on a session.
    CashMovement,
    /// Catalog product.
    Product,
    /// Manual stock correction.
    StockAdjustment,
    /// Customer record.
    Customer,
    /// Anything the engine has no special handling for.
    #[serde(other)]
    Other,
}

impl ResourceKind {
    /// Returns the storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Sale => "sale",
            ResourceKind::SaleItem => "sale_item",
            ResourceKind::CashSession => "cash_session",
            ResourceKind::CashMovement => "cash_movement",
            ResourceKind::Product => "product",
            ResourceKind::StockAdjustment => "stock_adjustment",
            ResourceKind::Customer => "customer",
            ResourceKind::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sale" => ResourceKind::Sale,
            "sale_item" => ResourceKind::SaleItem,
            "cash_session" => ResourceKind::CashSession,
            "cash_movement" => ResourceKind::CashMovement,
            "product" => ResourceKind::Product,
            "stock_adjustment" => ResourceKind::StockAdjustment,
            "customer" => ResourceKind::Customer,
            _ => ResourceKind::Other,
        })
    }
}

// =============================================================================
// Mutation Kind
// =============================================================================

/// What a queued operation does.
///
/// ## Mergeable vs Discrete
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  MERGEABLE (collapse rules apply)  │  DISCRETE (never merged)           │
/// │  ────────────────────────────────  │  ──────────────────────────────    │
/// │  Create                            │  OpenCashSession                   │
/// │  Update                            │  CloseCashSession                  │
/// │  Delete                            │  CashMovement                      │
/// │                                    │  ConfirmSale                       │
/// │                                    │                                    │
/// │  State-shaped: only the final      │  Each is an independently          │
/// │  state matters                     │  effectful business event          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    OpenCashSession,
    CloseCashSession,
    CashMovement,
    ConfirmSale,
}

impl MutationKind {
    /// Returns true if collapse rules may merge or drop this operation.
    pub fn is_mergeable(&self) -> bool {
        matches!(
            self,
            MutationKind::Create | MutationKind::Update | MutationKind::Delete
        )
    }

    /// Returns the storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::OpenCashSession => "open_cash_session",
            MutationKind::CloseCashSession => "close_cash_session",
            MutationKind::CashMovement => "cash_movement",
            MutationKind::ConfirmSale => "confirm_sale",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            "open_cash_session" => Ok(MutationKind::OpenCashSession),
            "close_cash_session" => Ok(MutationKind::CloseCashSession),
            "cash_movement" => Ok(MutationKind::CashMovement),
            "confirm_sale" => Ok(MutationKind::ConfirmSale),
            other => Err(CoreError::unknown("mutation kind", other)),
        }
    }
}

// =============================================================================
// Mutation Status
// =============================================================================

/// Lifecycle of a mutation log entry.
///
/// `Pending → Done` on confirmed replay, `Pending → Failed` on a permanent
/// rejection. Failed entries are only removed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl MutationStatus {
    /// Returns the storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Done => "done",
            MutationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "done" => Ok(MutationStatus::Done),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(CoreError::unknown("mutation status", other)),
        }
    }
}

// =============================================================================
// HTTP Method
// =============================================================================

/// Method of a replayed mutating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(CoreError::unknown("http method", other)),
        }
    }
}

// =============================================================================
// Local Placeholder Id
// =============================================================================

/// Client-assigned placeholder id for a resource created offline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Generates a fresh placeholder id (`local-<uuid>`).
    pub fn generate() -> Self {
        LocalId(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// Wraps an existing placeholder, returning None if it lacks the prefix.
    pub fn parse(id: &str) -> Option<Self> {
        is_placeholder(id).then(|| LocalId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true if `id` is a client placeholder rather than a server id.
#[inline]
pub fn is_placeholder(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Generates a new idempotency token.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Mutations
// =============================================================================

/// A mutating action as submitted by the application.
///
/// The idempotency token is minted here and stays with the operation for its
/// whole life: an immediate send, a later queued replay and any retry all
/// carry the same token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMutation {
    pub idempotency_token: String,
    pub store_id: String,
    pub resource_kind: ResourceKind,
    /// Target resource; a placeholder before the server assigns an id.
    pub resource_id: String,
    pub kind: MutationKind,
    pub request: ReplayRequest,
}

impl NewMutation {
    /// Creates a mutation with a freshly generated idempotency token.
    pub fn new(
        store_id: impl Into<String>,
        resource_kind: ResourceKind,
        resource_id: impl Into<String>,
        kind: MutationKind,
        request: ReplayRequest,
    ) -> Self {
        NewMutation {
            idempotency_token: generate_token(),
            store_id: store_id.into(),
            resource_kind,
            resource_id: resource_id.into(),
            kind,
            request,
        }
    }
}

/// An entry in the durable mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationLogEntry {
    /// Internal row id.
    pub id: i64,
    pub idempotency_token: String,
    pub store_id: String,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub kind: MutationKind,
    /// Method, path and body captured at enqueue time.
    pub request: ReplayRequest,
    pub status: MutationStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set just before the first send; None means the server never saw it.
    pub attempted_at: Option<DateTime<Utc>>,
}

impl MutationLogEntry {
    /// Returns the captured HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.request.method
    }

    /// Returns true if this entry has never been handed to the transport.
    pub fn is_unsent(&self) -> bool {
        self.attempted_at.is_none()
    }

    /// Returns true if the target resource only has a placeholder id.
    pub fn targets_placeholder(&self) -> bool {
        is_placeholder(&self.resource_id)
    }

    /// Ordering key: creation time, then insertion order.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }
}

// =============================================================================
// Replicas
// =============================================================================

/// Local copy of a server-owned business record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalReplicaRecord {
    /// Stable client id (equal to the server id for server-originated rows).
    pub local_id: String,
    /// Canonical id, None until the server has created the record.
    pub server_id: Option<String>,
    pub store_id: String,
    pub resource_kind: ResourceKind,
    /// Business fields mirroring the server entity.
    pub fields: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Lower bound for the next "changes since" pull of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub store_id: String,
    pub since: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mergeable_kinds() {
        assert!(MutationKind::Create.is_mergeable());
        assert!(MutationKind::Update.is_mergeable());
        assert!(MutationKind::Delete.is_mergeable());
        assert!(!MutationKind::OpenCashSession.is_mergeable());
        assert!(!MutationKind::CloseCashSession.is_mergeable());
        assert!(!MutationKind::CashMovement.is_mergeable());
        assert!(!MutationKind::ConfirmSale.is_mergeable());
    }

    #[test]
    fn test_storage_names_round_trip() {
        for kind in [
            MutationKind::Create,
            MutationKind::ConfirmSale,
            MutationKind::CashMovement,
        ] {
            assert_eq!(kind.as_str().parse::<MutationKind>().unwrap(), kind);
        }
        assert_eq!("failed".parse::<MutationStatus>().unwrap(), MutationStatus::Failed);
        assert!("archived".parse::<MutationStatus>().is_err());
    }

    #[test]
    fn test_unknown_resource_kind_is_other() {
        assert_eq!("loyalty_card".parse::<ResourceKind>().unwrap(), ResourceKind::Other);
        let kind: ResourceKind = serde_json::from_str("\"loyalty_card\"").unwrap();
        assert_eq!(kind, ResourceKind::Other);
    }

    #[test]
    fn test_local_id() {
        let id = LocalId::generate();
        assert!(is_placeholder(id.as_str()));
        assert!(LocalId::parse("srv-42").is_none());
        assert_eq!(LocalId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn test_new_mutation_gets_token() {
        let a = NewMutation::new(
            "store-1",
            ResourceKind::Sale,
            "local-1",
            MutationKind::Create,
            ReplayRequest::new(HttpMethod::Post, "/sales"),
        );
        let b = a.clone();
        assert_eq!(a.idempotency_token, b.idempotency_token);
        assert_ne!(a.idempotency_token, generate_token());
    }
}
