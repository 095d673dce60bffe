//! # Server Change Feed
//!
//! Wire shape of the "changes since" response and its flattening into
//! individually timestamped server-origin items.
//!
//! ```text
//! GET /sync/changes?since=2024-05-01T10:00:00Z
//!
//! {
//!   "stockMovements": [ { "id", "productId", "quantityDelta", "reason", "occurredAt" } ],
//!   "records":        [ { "kind", "id", "deleted", "data", "updatedAt" } ],
//!   "events":         [ { "id", "kind", "event", "occurredAt" } ],
//!   "serverTime":     "2024-05-01T10:05:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ResourceKind;

/// A stock-affecting movement recorded on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovementChange {
    pub id: String,
    pub product_id: String,
    pub quantity_delta: i64,
    #[serde(default)]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// An aggregate record updated (or deleted) on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    /// Full canonical body; Null for deletions.
    #[serde(default)]
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// Any other event that only affects caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AncillaryEvent {
    pub id: String,
    pub kind: ResourceKind,
    pub event: String,
    pub occurred_at: DateTime<Utc>,
}

/// The full response of the changes endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(default)]
    pub stock_movements: Vec<StockMovementChange>,
    #[serde(default)]
    pub records: Vec<RecordChange>,
    #[serde(default)]
    pub events: Vec<AncillaryEvent>,
    /// Server clock to use as the next checkpoint.
    pub server_time: DateTime<Utc>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.stock_movements.is_empty() && self.records.is_empty() && self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stock_movements.len() + self.records.len() + self.events.len()
    }

    /// Flattens the categorized lists, sorted by timestamp.
    ///
    /// The sort is stable; items sharing a timestamp keep category order
    /// (movements, records, events) and their order within the feed.
    pub fn into_changes(self) -> Vec<ServerChange> {
        let mut changes: Vec<ServerChange> = self
            .stock_movements
            .into_iter()
            .map(ServerChange::StockMovement)
            .chain(self.records.into_iter().map(ServerChange::Record))
            .chain(self.events.into_iter().map(ServerChange::Event))
            .collect();
        changes.sort_by_key(|c| c.occurred_at());
        changes
    }
}

/// One server-origin item of the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerChange {
    StockMovement(StockMovementChange),
    Record(RecordChange),
    Event(AncillaryEvent),
}

impl ServerChange {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ServerChange::StockMovement(m) => m.occurred_at,
            ServerChange::Record(r) => r.updated_at,
            ServerChange::Event(e) => e.occurred_at,
        }
    }

    /// Resource kind whose caches this change affects.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            ServerChange::StockMovement(_) => ResourceKind::StockAdjustment,
            ServerChange::Record(r) => r.kind,
            ServerChange::Event(e) => e.kind,
        }
    }

    /// Short label for logs and pass reports.
    pub fn describe(&self) -> String {
        match self {
            ServerChange::StockMovement(m) => {
                format!("stock_movement {} {:+}", m.product_id, m.quantity_delta)
            }
            ServerChange::Record(r) if r.deleted => format!("delete {} {}", r.kind, r.id),
            ServerChange::Record(r) => format!("record {} {}", r.kind, r.id),
            ServerChange::Event(e) => format!("event {} {}", e.kind, e.event),
        }
    }
}
