//! # Sync State Publisher
//!
//! Holds the latest [`SyncSnapshot`] per store and pushes every change to
//! subscribed observers. Notification is synchronous: an observer sees the
//! snapshot before `publish` returns.
//!
//! ```text
//!   SyncEngine ── publish_syncing / publish_settled ──► StatePublisher
//!                                                          │
//!                                   ┌──────────────────────┼─────────────┐
//!                                   ▼                      ▼             ▼
//!                              observer #1            observer #2     snapshot()
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use till_core::{SyncSnapshot, SyncStatus};
use till_db::StatusCounts;

/// Receives sync state changes.
pub trait SyncStateObserver: Send + Sync {
    fn on_state(&self, snapshot: &SyncSnapshot);
}

/// Observer that ignores everything.
pub struct NoOpObserver;

impl SyncStateObserver for NoOpObserver {
    fn on_state(&self, _snapshot: &SyncSnapshot) {}
}

/// Handle returned by [`StatePublisher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Broadcasts per-store sync state.
#[derive(Default)]
pub struct StatePublisher {
    next_id: AtomicU64,
    observers: Mutex<BTreeMap<SubscriptionId, Arc<dyn SyncStateObserver>>>,
    snapshots: Mutex<HashMap<String, SyncSnapshot>>,
}

impl StatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. It is called for every later publish.
    pub fn subscribe(&self, observer: Arc<dyn SyncStateObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).insert(id, observer);
        debug!(subscription = id.0, "Sync state observer subscribed");
        id
    }

    /// Removes an observer. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.observers).remove(&id).is_some()
    }

    /// Latest snapshot of a store (idle if nothing was published yet).
    pub fn snapshot(&self, store_id: &str) -> SyncSnapshot {
        lock(&self.snapshots)
            .get(store_id)
            .cloned()
            .unwrap_or_else(|| SyncSnapshot::idle(store_id))
    }

    /// Stores and broadcasts a snapshot.
    pub fn publish(&self, snapshot: SyncSnapshot) {
        lock(&self.snapshots).insert(snapshot.store_id.clone(), snapshot.clone());

        // Observers run outside the lock so they may call back into us.
        let observers: Vec<_> = lock(&self.observers).values().cloned().collect();
        for observer in observers {
            observer.on_state(&snapshot);
        }
    }

    /// Marks a pass as running, keeping the previous counters.
    pub fn publish_syncing(&self, store_id: &str) {
        let mut snapshot = self.snapshot(store_id);
        snapshot.status = SyncStatus::Syncing;
        self.publish(snapshot);
    }

    /// Publishes the state after a pass or an operator action.
    ///
    /// `synced_at` is set when a pass completed; otherwise the previous
    /// value is kept.
    pub fn publish_settled(
        &self,
        store_id: &str,
        counts: StatusCounts,
        aborted: bool,
        last_error: Option<String>,
        synced_at: Option<DateTime<Utc>>,
    ) {
        let previous = self.snapshot(store_id);
        self.publish(SyncSnapshot {
            store_id: store_id.to_string(),
            pending_count: counts.pending,
            failed_count: counts.failed,
            status: SyncSnapshot::settled_status(counts.failed, aborted),
            last_error,
            last_synced_at: synced_at.or(previous.last_synced_at),
        });
    }

    /// Updates the counters only, keeping status and last error.
    pub fn publish_counts(&self, store_id: &str, counts: StatusCounts) {
        let mut snapshot = self.snapshot(store_id);
        snapshot.pending_count = counts.pending;
        snapshot.failed_count = counts.failed;
        if snapshot.status == SyncStatus::Idle && counts.failed > 0 {
            snapshot.status = SyncStatus::Error;
        }
        self.publish(snapshot);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
