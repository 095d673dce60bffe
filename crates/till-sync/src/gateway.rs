//! # Gateway
//!
//! The application-facing surface of one store context: mutating actions go
//! through [`Gateway::submit`], reads through [`Gateway::read`].
//!
//! ## Submit Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  submit(mutation)                                                       │
//! │     │                                                                   │
//! │     ├── offline? ─────────────────────────────┐                         │
//! │     ├── store already has pending entries? ───┤                         │
//! │     ├── references an unmapped placeholder? ──┼──► enqueue → Deferred  │
//! │     │                                         │                         │
//! │     ▼  send now (same token as a later replay)│                         │
//! │     ├── 2xx ─► replica + caches ─► Applied    │                         │
//! │     ├── 4xx ─► Err(PermanentRejection)        │                         │
//! │     └── 5xx / no reply ─► mark offline ───────┘                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deferring whenever the queue is non-empty keeps a new action behind the
//! ones recorded before it.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use till_core::{
    is_placeholder, CacheKey, LocalReplicaRecord, MutationKind, NewMutation, SyncSnapshot,
};

use crate::engine::{OperationTarget, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::executor::ExecutionOutcome;
use crate::transport::HttpRequest;

/// What happened to a submitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The server confirmed it; `body` is the authoritative resource.
    Applied { body: Option<Value> },
    /// Accepted locally and queued; it will be replayed with `token`.
    Deferred { token: String },
}

impl Submission {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Submission::Deferred { .. })
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Straight from the server; the cache now holds it.
    Fresh(Value),
    /// The server was unreachable; an unexpired cache entry was served.
    Cached(Value),
    /// Unreachable and nothing usable cached.
    Unavailable,
}

impl ReadOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ReadOutcome::Fresh(v) | ReadOutcome::Cached(v) => Some(v),
            ReadOutcome::Unavailable => None,
        }
    }
}

/// Submit/read entry point for one store.
#[derive(Debug, Clone)]
pub struct Gateway {
    engine: Arc<SyncEngine>,
}

impl Gateway {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Gateway { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn state(&self) -> SyncSnapshot {
        self.engine.publisher().snapshot(self.engine.store_id())
    }

    // =========================================================================
    // Submit
    // =========================================================================

    /// Sends a mutation now or queues it for the next pass.
    ///
    /// ## Errors
    /// - `PermanentRejection` if the server answered 4xx
    /// - `UnknownStore` if the mutation targets another store
    pub async fn submit(&self, mutation: NewMutation) -> SyncResult<Submission> {
        let engine = &self.engine;
        if mutation.store_id != engine.store_id {
            return Err(SyncError::UnknownStore(mutation.store_id));
        }

        let mut ids = HashMap::new();
        if let Some(reason) = self.defer_reason(&mutation, &mut ids).await? {
            return self.defer(mutation, reason).await;
        }

        let outcome = engine
            .executor
            .execute(
                &mutation.store_id,
                &mutation.idempotency_token,
                &mutation.request,
                &ids,
            )
            .await;

        match outcome {
            ExecutionOutcome::Applied { body, server_id } => {
                engine.connectivity.set_online(true);
                let target = OperationTarget {
                    store_id: &mutation.store_id,
                    resource_kind: mutation.resource_kind,
                    resource_id: &mutation.resource_id,
                    kind: mutation.kind,
                };
                engine
                    .absorb_confirmed(target, body.as_ref(), server_id, &mut ids)
                    .await?;
                info!(
                    store_id = %mutation.store_id,
                    token = %mutation.idempotency_token,
                    kind = %mutation.kind,
                    "Mutation applied immediately"
                );
                Ok(Submission::Applied { body })
            }
            ExecutionOutcome::Rejected(err) => {
                warn!(token = %mutation.idempotency_token, error = %err, "Mutation rejected");
                Err(err)
            }
            ExecutionOutcome::Transient(err) => {
                engine.connectivity.set_online(false);
                self.defer(mutation, &err.to_string()).await
            }
        }
    }

    async fn defer_reason(
        &self,
        mutation: &NewMutation,
        ids: &mut HashMap<String, String>,
    ) -> SyncResult<Option<&'static str>> {
        let engine = &self.engine;

        if !engine.connectivity.is_online() {
            return Ok(Some("offline"));
        }
        if engine.db.mutations().has_pending(&engine.store_id).await? {
            return Ok(Some("queue not empty"));
        }

        engine.fill_known_ids(&mutation.request, ids).await?;
        let unmapped = mutation
            .request
            .local_references()
            .iter()
            .any(|id| !ids.contains_key(id));
        if unmapped {
            return Ok(Some("unmapped placeholder"));
        }
        Ok(None)
    }

    async fn defer(&self, mutation: NewMutation, reason: &str) -> SyncResult<Submission> {
        let engine = &self.engine;
        let entry = engine.db.mutations().enqueue(&mutation).await?;

        if mutation.kind == MutationKind::Create && is_placeholder(&mutation.resource_id) {
            if let Some(fields) = mutation.request.body.clone() {
                engine
                    .db
                    .replicas()
                    .upsert_local(&LocalReplicaRecord {
                        local_id: mutation.resource_id.clone(),
                        server_id: None,
                        store_id: mutation.store_id.clone(),
                        resource_kind: mutation.resource_kind,
                        fields,
                        updated_at: entry.created_at,
                    })
                    .await?;
            }
        }

        debug!(token = %entry.idempotency_token, reason = %reason, "Mutation deferred");
        engine.refresh_counts().await;

        Ok(Submission::Deferred {
            token: entry.idempotency_token,
        })
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Cache-through read of `path` with query `params`.
    ///
    /// ## Errors
    /// `PermanentRejection` if the server answered 4xx. Other failures fall
    /// back to the cache.
    pub async fn read(&self, path: &str, params: &[(&str, &str)]) -> SyncResult<ReadOutcome> {
        let engine = &self.engine;
        let key = CacheKey::new(path, engine.store_id.as_str(), params);
        let cache = engine.db.cache();

        if engine.connectivity.is_online() {
            let mut request = HttpRequest::get(key.path.as_str())
                .with_header(engine.store_header.as_str(), engine.store_id.as_str());
            for (k, v) in params {
                request = request.with_query(*k, *v);
            }

            match engine.transport.send(request).await {
                Ok(response) if response.is_success() => {
                    let value = response.body.unwrap_or(Value::Null);
                    cache.write(&key, &value, &engine.policy).await?;
                    return Ok(ReadOutcome::Fresh(value));
                }
                Ok(response) => {
                    let err = SyncError::from_status(response.status, response.error_message());
                    if err.is_permanent() {
                        return Err(err);
                    }
                    warn!(path = %key.path, error = %err, "Read failed, trying cache");
                    engine.connectivity.set_online(false);
                }
                Err(e) => {
                    warn!(path = %key.path, error = %e, "Read failed, trying cache");
                    engine.connectivity.set_online(false);
                }
            }
        }

        Ok(match cache.read_at(&key, Utc::now()).await? {
            Some(entry) => ReadOutcome::Cached(entry.value),
            None => ReadOutcome::Unavailable,
        })
    }
}
