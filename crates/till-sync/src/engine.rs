//! # Sync Engine
//!
//! One engine per store context. A pass pulls server changes, collapses the
//! local queue, merges both into one timeline and applies it strictly in
//! order.
//!
//! ## Pass Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          run_pass(store)                                │
//! │                                                                         │
//! │  try_lock ── busy ──► AlreadyRunning                                   │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  publish Syncing                                                       │
//! │     │                                                                   │
//! │  1. pull changes since checkpoint   (failure → push-only pass)         │
//! │  2. pending queue → collapse → mark dropped entries done               │
//! │  3. interleave(server, local) by timestamp, server first on ties       │
//! │  4. for each item, in order:                                           │
//! │       Server ─► upsert/remove replica, invalidate caches               │
//! │       Local  ─► substitute ids, execute                                │
//! │                  ├ Applied   → record id, replica, invalidate, done    │
//! │                  ├ Rejected  → failed, continue                        │
//! │                  └ Transient → ABORT (rest stays pending)              │
//! │  5. checkpoint ← server_time   (only if pulled and not aborted)        │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  publish settled counters                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use till_core::invalidation::{prefixes_for_change, prefixes_for_operation};
use till_core::{
    collapse, interleave, is_placeholder, CachePolicy, Collapsed, MutationKind, MutationLogEntry,
    Origin, ReplayRequest, ResourceKind, ServerChange, TimelineItem,
};
use till_db::{Database, StatusCounts};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::executor::{ExecutionOutcome, MutationExecutor};
use crate::publisher::StatePublisher;
use crate::puller::ChangePuller;
use crate::transport::SyncTransport;

// =============================================================================
// Connectivity
// =============================================================================

/// Shared belief about whether the server is reachable.
///
/// Starts online; flipped by transport failures and connectivity
/// notifications.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Default for Connectivity {
    fn default() -> Self {
        Connectivity(Arc::new(AtomicBool::new(true)))
    }
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::SeqCst)
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// One processed timeline item.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub origin: Origin,
    pub at: DateTime<Utc>,
    pub description: String,
}

/// What a pass did.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub steps: Vec<StepRecord>,
    pub pulled: bool,
    pub applied: usize,
    pub failed: usize,
    pub collapsed: usize,
    pub checkpoint_advanced: bool,
    /// Last permanent rejection seen in this pass.
    pub last_rejection: Option<String>,
    /// Set when a transient failure stopped the pass.
    pub abort_reason: Option<String>,
}

impl PassReport {
    fn record(&mut self, origin: Origin, at: DateTime<Utc>, description: String) {
        self.steps.push(StepRecord {
            origin,
            at,
            description,
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

/// Result of [`SyncEngine::run_pass`].
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// Every item was processed.
    Completed(PassReport),
    /// A transient failure stopped the pass; the checkpoint did not move.
    Aborted(PassReport),
    /// Another pass for this store was in flight; nothing was done.
    AlreadyRunning,
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(r) | PassOutcome::Aborted(r) => Some(r),
            PassOutcome::AlreadyRunning => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, PassOutcome::Aborted(_))
    }
}

enum LocalStep {
    Applied,
    Rejected(String),
    Aborted(String),
}

/// The fields of an operation that decide what a confirmed response does
/// to the local store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperationTarget<'a> {
    pub store_id: &'a str,
    pub resource_kind: ResourceKind,
    pub resource_id: &'a str,
    pub kind: MutationKind,
}

impl<'a> From<&'a MutationLogEntry> for OperationTarget<'a> {
    fn from(entry: &'a MutationLogEntry) -> Self {
        OperationTarget {
            store_id: &entry.store_id,
            resource_kind: entry.resource_kind,
            resource_id: &entry.resource_id,
            kind: entry.kind,
        }
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Reconciles one store context with the server.
pub struct SyncEngine {
    pub(crate) store_id: String,
    pub(crate) db: Database,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) executor: MutationExecutor,
    pub(crate) connectivity: Connectivity,
    pub(crate) policy: CachePolicy,
    pub(crate) store_header: String,
    puller: ChangePuller,
    publisher: Arc<StatePublisher>,
    pass_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store_id: impl Into<String>,
        db: Database,
        transport: Arc<dyn SyncTransport>,
        config: &SyncConfig,
        publisher: Arc<StatePublisher>,
    ) -> Self {
        SyncEngine {
            store_id: store_id.into(),
            executor: MutationExecutor::new(transport.clone(), config),
            puller: ChangePuller::new(transport.clone(), db.checkpoints(), config),
            db,
            transport,
            connectivity: Connectivity::default(),
            policy: config.cache_policy(),
            store_header: config.server.store_header.clone(),
            publisher,
            pass_lock: Mutex::new(()),
        }
    }

    /// Shares a connectivity flag with other engines.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Returns true while a pass holds the store.
    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Runs one pass unless one is already in flight for this store.
    pub async fn run_pass(&self) -> SyncResult<PassOutcome> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!(store_id = %self.store_id, "Pass already running, trigger ignored");
            return Ok(PassOutcome::AlreadyRunning);
        };

        info!(store_id = %self.store_id, "Sync pass started");
        self.publisher.publish_syncing(&self.store_id);

        match self.drive_pass().await {
            Ok(report) => {
                let aborted = report.is_aborted();
                let last_error = report.abort_reason.clone().or_else(|| report.last_rejection.clone());
                let synced_at = (!aborted).then(Utc::now);
                self.publish_settled(aborted, last_error, synced_at).await;

                if aborted {
                    warn!(
                        store_id = %self.store_id,
                        applied = report.applied,
                        reason = ?report.abort_reason,
                        "Sync pass aborted"
                    );
                    Ok(PassOutcome::Aborted(report))
                } else {
                    info!(
                        store_id = %self.store_id,
                        applied = report.applied,
                        failed = report.failed,
                        collapsed = report.collapsed,
                        checkpoint_advanced = report.checkpoint_advanced,
                        "Sync pass completed"
                    );
                    Ok(PassOutcome::Completed(report))
                }
            }
            Err(e) => {
                error!(store_id = %self.store_id, error = %e, "Sync pass failed");
                self.publish_settled(true, Some(e.to_string()), None).await;
                Err(e)
            }
        }
    }

    async fn drive_pass(&self) -> SyncResult<PassReport> {
        let mut report = PassReport::default();
        let mutations = self.db.mutations();

        // 1. Pull
        let (server_changes, server_time) = match self.puller.fetch_changes(&self.store_id).await? {
            Some(changes) => {
                report.pulled = true;
                self.connectivity.set_online(true);
                let server_time = changes.server_time;
                (changes.into_changes(), Some(server_time))
            }
            None => (Vec::new(), None),
        };

        // 2. Collapse
        let pending = mutations.get_pending(&self.store_id).await?;
        let captured: HashMap<i64, ReplayRequest> =
            pending.iter().map(|e| (e.id, e.request.clone())).collect();

        let Collapsed { kept, dropped } = collapse(pending);
        if !dropped.is_empty() {
            mutations.mark_collapsed(&dropped).await?;
            report.collapsed = dropped.len();
            debug!(store_id = %self.store_id, dropped = dropped.len(), "Queue collapsed");
        }
        for entry in &kept {
            if captured.get(&entry.id) != Some(&entry.request) {
                mutations.update_request(entry.id, &entry.request).await?;
            }
        }

        // 3. + 4. Interleave and apply
        let mut ids: HashMap<String, String> = HashMap::new();
        for item in interleave(server_changes, kept) {
            match item {
                TimelineItem::Server(change) => {
                    self.apply_server_change(&change).await?;
                    report.record(Origin::Server, change.occurred_at(), change.describe());
                }
                TimelineItem::Local(entry) => {
                    let step = self.apply_local(&entry, &mut ids).await?;
                    report.record(Origin::Local, entry.created_at, describe_entry(&entry));
                    match step {
                        LocalStep::Applied => report.applied += 1,
                        LocalStep::Rejected(message) => {
                            report.failed += 1;
                            report.last_rejection = Some(message);
                        }
                        LocalStep::Aborted(reason) => {
                            report.abort_reason = Some(reason);
                            return Ok(report);
                        }
                    }
                }
            }
        }

        // 5. Checkpoint
        if let Some(server_time) = server_time {
            report.checkpoint_advanced = self
                .db
                .checkpoints()
                .advance(&self.store_id, server_time)
                .await?;
        }

        Ok(report)
    }

    async fn apply_server_change(&self, change: &ServerChange) -> SyncResult<()> {
        let replicas = self.db.replicas();

        if let ServerChange::Record(record) = change {
            if record.deleted {
                replicas
                    .remove_by_server_id(&self.store_id, record.kind, &record.id)
                    .await?;
            } else {
                replicas
                    .upsert_from_server(&self.store_id, record.kind, &record.id, &record.data, record.updated_at)
                    .await?;
            }
        }

        let removed = self
            .db
            .cache()
            .invalidate_by_prefixes(prefixes_for_change(change), &self.store_id)
            .await?;

        debug!(store_id = %self.store_id, change = %change.describe(), invalidated = removed, "Applied server change");
        Ok(())
    }

    async fn apply_local(
        &self,
        entry: &MutationLogEntry,
        ids: &mut HashMap<String, String>,
    ) -> SyncResult<LocalStep> {
        let mutations = self.db.mutations();

        self.fill_known_ids(&entry.request, ids).await?;

        // Only a request that can actually go out counts as attempted.
        let outcome = match entry.request.resolve(&*ids) {
            Ok(resolved) => {
                mutations.mark_attempted(entry.id).await?;
                self.executor
                    .send(&entry.store_id, &entry.idempotency_token, resolved)
                    .await
            }
            Err(e) => ExecutionOutcome::Rejected(e.into()),
        };

        match outcome {
            ExecutionOutcome::Applied { body, server_id } => {
                self.connectivity.set_online(true);
                self.absorb_confirmed(entry.into(), body.as_ref(), server_id, ids)
                    .await?;
                mutations.mark_done(entry.id).await?;
                debug!(store_id = %self.store_id, token = %entry.idempotency_token, "Operation applied");
                Ok(LocalStep::Applied)
            }
            ExecutionOutcome::Rejected(err) => {
                let message = err.to_string();
                mutations.mark_failed(entry.id, &message).await?;
                warn!(
                    store_id = %self.store_id,
                    token = %entry.idempotency_token,
                    error = %message,
                    "Operation rejected"
                );
                Ok(LocalStep::Rejected(message))
            }
            ExecutionOutcome::Transient(err) => {
                let message = err.to_string();
                mutations.record_transient_error(entry.id, &message).await?;
                self.connectivity.set_online(false);
                Ok(LocalStep::Aborted(message))
            }
        }
    }

    /// Adds server ids assigned in earlier passes for every placeholder the
    /// request references and this pass has not mapped yet.
    pub(crate) async fn fill_known_ids(
        &self,
        request: &ReplayRequest,
        ids: &mut HashMap<String, String>,
    ) -> SyncResult<()> {
        let replicas = self.db.replicas();
        for local_id in request.local_references() {
            if ids.contains_key(&local_id) {
                continue;
            }
            if let Some(server_id) = replicas.server_id_for(&self.store_id, &local_id).await? {
                ids.insert(local_id, server_id);
            }
        }
        Ok(())
    }

    /// Applies a confirmed response to the local store: id mapping, replica,
    /// and cache invalidation.
    pub(crate) async fn absorb_confirmed(
        &self,
        target: OperationTarget<'_>,
        body: Option<&Value>,
        server_id: Option<String>,
        ids: &mut HashMap<String, String>,
    ) -> SyncResult<()> {
        let replicas = self.db.replicas();
        let placeholder = is_placeholder(target.resource_id).then_some(target.resource_id);

        if target.kind == MutationKind::Delete {
            match placeholder {
                Some(local_id) => {
                    replicas
                        .remove_local(target.store_id, target.resource_kind, local_id)
                        .await?;
                }
                None => {
                    replicas
                        .remove_by_server_id(target.store_id, target.resource_kind, target.resource_id)
                        .await?;
                }
            }
        } else {
            let mapped = placeholder.and_then(|id| ids.get(id).cloned());

            // An unmapped placeholder takes the id the server just assigned.
            if let (Some(local_id), None, Some(assigned)) = (placeholder, &mapped, &server_id) {
                ids.insert(local_id.to_string(), assigned.clone());
            }

            let known = server_id
                .or(mapped)
                .or_else(|| placeholder.is_none().then(|| target.resource_id.to_string()));

            if let (Some(known), Some(body)) = (known, body.filter(|b| b.is_object())) {
                let rebind = placeholder.filter(|id| ids.get(*id) == Some(&known));
                replicas
                    .record_confirmed(target.store_id, target.resource_kind, rebind, &known, body)
                    .await?;
            }
        }

        let prefixes = prefixes_for_operation(target.resource_kind, target.kind);
        self.db
            .cache()
            .invalidate_by_prefixes(&prefixes, target.store_id)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Operator Actions
    // =========================================================================

    /// Failed entries awaiting an operator.
    pub async fn failed_entries(&self) -> SyncResult<Vec<MutationLogEntry>> {
        Ok(self.db.mutations().failed_entries(&self.store_id).await?)
    }

    /// Removes every failed entry without retrying it and republishes state.
    pub async fn clear_failed(&self) -> SyncResult<u64> {
        let removed = self.db.mutations().clear_failed(&self.store_id).await?;
        info!(store_id = %self.store_id, removed, "Cleared failed operations");
        self.publish_settled(false, None, None).await;
        Ok(removed)
    }

    /// Current counters straight from the log.
    pub async fn counts(&self) -> SyncResult<StatusCounts> {
        Ok(self.db.mutations().count_by_status(&self.store_id).await?)
    }

    /// Republishes the counters after the queue changed outside a pass.
    pub(crate) async fn refresh_counts(&self) {
        match self.counts().await {
            Ok(counts) => self.publisher.publish_counts(&self.store_id, counts),
            Err(e) => warn!(store_id = %self.store_id, error = %e, "Cannot read queue counters"),
        }
    }

    pub(crate) async fn publish_settled(
        &self,
        aborted: bool,
        last_error: Option<String>,
        synced_at: Option<DateTime<Utc>>,
    ) {
        match self.counts().await {
            Ok(counts) => {
                self.publisher
                    .publish_settled(&self.store_id, counts, aborted, last_error, synced_at)
            }
            Err(e) => {
                error!(store_id = %self.store_id, error = %e, "Cannot read queue counters");
                let previous = self.publisher.snapshot(&self.store_id);
                let counts = StatusCounts {
                    pending: previous.pending_count,
                    done: 0,
                    failed: previous.failed_count,
                };
                self.publisher
                    .publish_settled(&self.store_id, counts, true, Some(e.to_string()), None);
            }
        }
    }
}

fn describe_entry(entry: &MutationLogEntry) -> String {
    format!(
        "{} {} {}",
        entry.kind,
        entry.request.method,
        entry.request.template()
    )
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store_id", &self.store_id)
            .field("online", &self.connectivity.is_online())
            .finish_non_exhaustive()
    }
}
