//! # Mutation Executor
//!
//! Performs exactly one network call for one operation and says what
//! happened. It never touches the local store; the caller decides what an
//! outcome means for the queue.
//!
//! ```text
//!   ReplayRequest ──resolve──► ResolvedRequest ──+ headers──► transport
//!        │                                                        │
//!        │ unknown placeholder                    ┌───────────────┼──────────────┐
//!        ▼                                        ▼               ▼              ▼
//!    Rejected                                   2xx             4xx        5xx / no reply
//!                                             Applied         Rejected       Transient
//! ```

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use till_core::{IdResolver, ReplayRequest, ResolvedRequest, SERVER_ID_FIELD};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::transport::{HttpRequest, SyncTransport};

/// Result of one replay attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// 2xx. `body` is the authoritative resource, `server_id` its id field.
    Applied {
        body: Option<Value>,
        server_id: Option<String>,
    },
    /// Terminal for this operation only.
    Rejected(SyncError),
    /// Worth retrying on a later pass.
    Transient(SyncError),
}

impl ExecutionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ExecutionOutcome::Applied { .. })
    }
}

/// Sends operations with their idempotency token and store scope attached.
#[derive(Clone)]
pub struct MutationExecutor {
    transport: Arc<dyn SyncTransport>,
    idempotency_header: String,
    store_header: String,
}

impl MutationExecutor {
    pub fn new(transport: Arc<dyn SyncTransport>, config: &SyncConfig) -> Self {
        MutationExecutor {
            transport,
            idempotency_header: config.server.idempotency_header.clone(),
            store_header: config.server.store_header.clone(),
        }
    }

    /// Resolves placeholders, sends, and classifies the response.
    pub async fn execute<R: IdResolver + ?Sized>(
        &self,
        store_id: &str,
        token: &str,
        request: &ReplayRequest,
        resolver: &R,
    ) -> ExecutionOutcome {
        match request.resolve(resolver) {
            Ok(resolved) => self.send(store_id, token, resolved).await,
            Err(e) => {
                warn!(token = %token, path = %request.template(), error = %e, "Cannot resolve request");
                ExecutionOutcome::Rejected(e.into())
            }
        }
    }

    /// Sends an already resolved request and classifies the response.
    pub async fn send(&self, store_id: &str, token: &str, resolved: ResolvedRequest) -> ExecutionOutcome {
        let http = HttpRequest::new(resolved.method, resolved.path)
            .with_header(self.idempotency_header.as_str(), token)
            .with_header(self.store_header.as_str(), store_id)
            .with_body(resolved.body);

        debug!(token = %token, method = %http.method, path = %http.path, "Replaying operation");

        match self.transport.send(http).await {
            Ok(response) if response.is_success() => {
                let server_id = response.body.as_ref().and_then(extract_server_id);
                ExecutionOutcome::Applied {
                    body: response.body,
                    server_id,
                }
            }
            Ok(response) => {
                let err = SyncError::from_status(response.status, response.error_message());
                if err.is_permanent() {
                    ExecutionOutcome::Rejected(err)
                } else {
                    ExecutionOutcome::Transient(err)
                }
            }
            Err(e) => ExecutionOutcome::Transient(e.into()),
        }
    }
}

/// Reads the id field of an authoritative body (string or number).
pub fn extract_server_id(body: &Value) -> Option<String> {
    match body.get(SERVER_ID_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
