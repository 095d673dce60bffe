//! # Change Puller
//!
//! Fetches server-side changes since the store's checkpoint.
//!
//! Pull semantics are at-least-once: any failure yields `None`, the pass
//! goes on push-only, and the checkpoint stays where it was so the same
//! window is requested again next time.

use chrono::SecondsFormat;
use std::sync::Arc;
use tracing::{debug, warn};

use till_core::ChangeSet;
use till_db::CheckpointRepository;

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::transport::{HttpRequest, SyncTransport};

/// Query parameter carrying the lower bound.
pub const SINCE_PARAM: &str = "since";

#[derive(Clone)]
pub struct ChangePuller {
    transport: Arc<dyn SyncTransport>,
    checkpoints: CheckpointRepository,
    changes_path: String,
    store_header: String,
}

impl ChangePuller {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        checkpoints: CheckpointRepository,
        config: &SyncConfig,
    ) -> Self {
        ChangePuller {
            transport,
            checkpoints,
            changes_path: config.server.changes_path.clone(),
            store_header: config.server.store_header.clone(),
        }
    }

    /// Pulls changes for `store_id`.
    ///
    /// ## Returns
    /// - `Ok(Some(changes))` on a 2xx with a decodable body
    /// - `Ok(None)` on transport failure, non-2xx, or an undecodable body
    /// - `Err(_)` only if the checkpoint could not be read
    pub async fn fetch_changes(&self, store_id: &str) -> SyncResult<Option<ChangeSet>> {
        let since = self.checkpoints.get(store_id).await?.map(|c| c.since);

        let mut request =
            HttpRequest::get(self.changes_path.as_str()).with_header(self.store_header.as_str(), store_id);
        if let Some(since) = since {
            request = request.with_query(SINCE_PARAM, since.to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(store_id = %store_id, error = %e, "Change pull failed, continuing push-only");
                return Ok(None);
            }
        };

        if !response.is_success() {
            warn!(
                store_id = %store_id,
                status = response.status,
                error = %response.error_message(),
                "Change pull rejected, continuing push-only"
            );
            return Ok(None);
        }

        let Some(body) = response.body else {
            warn!(store_id = %store_id, "Change pull returned no body");
            return Ok(None);
        };

        match serde_json::from_value::<ChangeSet>(body) {
            Ok(changes) => {
                debug!(
                    store_id = %store_id,
                    since = ?since,
                    count = changes.len(),
                    server_time = %changes.server_time,
                    "Pulled server changes"
                );
                Ok(Some(changes))
            }
            Err(e) => {
                warn!(store_id = %store_id, error = %e, "Undecodable change set");
                Ok(None)
            }
        }
    }
}
