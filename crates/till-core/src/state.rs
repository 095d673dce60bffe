//! # Published Sync State
//!
//! The only state the engine exposes outward: counters and a coarse status
//! per store. Carries no business data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Overall sync status of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    /// The last pass aborted, or failed entries await an operator.
    Error,
}

/// Snapshot sent to subscribers after each pass transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncSnapshot {
    pub store_id: String,
    pub pending_count: i64,
    pub failed_count: i64,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    /// Initial snapshot for a store that has not synced yet.
    pub fn idle(store_id: impl Into<String>) -> Self {
        SyncSnapshot {
            store_id: store_id.into(),
            pending_count: 0,
            failed_count: 0,
            status: SyncStatus::Idle,
            last_error: None,
            last_synced_at: None,
        }
    }

    /// Status derived from counters when no pass is running.
    pub fn settled_status(failed_count: i64, last_pass_aborted: bool) -> SyncStatus {
        if last_pass_aborted || failed_count > 0 {
            SyncStatus::Error
        } else {
            SyncStatus::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_status() {
        assert_eq!(SyncSnapshot::settled_status(0, false), SyncStatus::Idle);
        assert_eq!(SyncSnapshot::settled_status(2, false), SyncStatus::Error);
        assert_eq!(SyncSnapshot::settled_status(0, true), SyncStatus::Error);
    }

    #[test]
    fn test_serialized_status() {
        let snap = SyncSnapshot::idle("s1");
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["pending_count"], 0);
    }
}
