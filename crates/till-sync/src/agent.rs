//! # Sync Agent
//!
//! Owns one [`SyncEngine`] per configured store and decides when passes run.
//!
//! ## Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent run loop                               │
//! │                                                                         │
//! │   SyncAgentHandle                                                      │
//! │     request_sync(store, Manual|Login|Reconnect) ──┐                    │
//! │     set_online(true)  ── was offline? ─ Reconnect ┤                    │
//! │                                                   ▼                    │
//! │   interval tick ─ Interval ─────────────► spawn engine.run_pass()      │
//! │      (skipped while a store backs off)            │  one task/store    │
//! │                                                   ▼                    │
//! │                                        pass finished ─► backoff update │
//! │                                                                         │
//! │   BACKOFF (interval triggers only)                                     │
//! │   Aborted pass → wait 1s, 2s, 4s ... up to max before the next poll    │
//! │   Completed pass or any explicit trigger → reset                       │
//! │                                                                         │
//! │   trigger while a pass runs → one more pass once it completes         │
//! │   maintenance tick (hourly): purge expired cache, old done entries     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Passes of different stores run concurrently; two passes of the same
//! store never do (the engine refuses the second one).

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use till_core::SyncSnapshot;
use till_db::Database;

use crate::config::SyncConfig;
use crate::engine::{Connectivity, PassOutcome, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::gateway::Gateway;
use crate::publisher::{StatePublisher, SyncStateObserver};
use crate::transport::SyncTransport;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

// =============================================================================
// Triggers & Commands
// =============================================================================

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity came back.
    Reconnect,
    /// The user asked for it.
    Manual,
    /// A user logged in.
    Login,
    /// Periodic poll.
    Interval,
}

impl SyncTrigger {
    /// Explicit triggers bypass and reset backoff.
    pub fn is_explicit(&self) -> bool {
        !matches!(self, SyncTrigger::Interval)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Reconnect => write!(f, "reconnect"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Login => write!(f, "login"),
            SyncTrigger::Interval => write!(f, "interval"),
        }
    }
}

#[derive(Debug)]
enum AgentCommand {
    Sync {
        store_id: Option<String>,
        trigger: SyncTrigger,
    },
    SetOnline(bool),
}

/// Message from a pass task back to the loop.
#[derive(Debug)]
struct PassFinished {
    store_id: String,
    result: PassResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassResult {
    Completed,
    Aborted,
    /// Another pass held the store.
    Skipped,
}

// =============================================================================
// Per-store Backoff
// =============================================================================

struct StoreBackoff {
    backoff: ExponentialBackoff,
    max: Duration,
    not_before: Option<Instant>,
}

impl StoreBackoff {
    fn new(config: &SyncConfig) -> Self {
        let max = Duration::from_secs(config.sync.max_backoff_secs);
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(config.sync.initial_backoff_ms),
            max_interval: max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        StoreBackoff {
            backoff,
            max,
            not_before: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| now >= t)
    }

    fn on_aborted(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_backoff().unwrap_or(self.max).min(self.max);
        self.not_before = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.backoff.reset();
        self.not_before = None;
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Runs sync passes for every configured store.
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    db: Database,
    engines: HashMap<String, Arc<SyncEngine>>,
    publisher: Arc<StatePublisher>,
    connectivity: Connectivity,
}

impl SyncAgent {
    /// Creates an agent with one engine per store in `config`.
    pub fn new(config: SyncConfig, db: Database, transport: Arc<dyn SyncTransport>) -> Self {
        let publisher = Arc::new(StatePublisher::new());
        let connectivity = Connectivity::default();

        let engines = config
            .store_ids()
            .into_iter()
            .map(|store_id| {
                let engine = SyncEngine::new(
                    store_id.clone(),
                    db.clone(),
                    transport.clone(),
                    &config,
                    publisher.clone(),
                )
                .with_connectivity(connectivity.clone());
                (store_id, Arc::new(engine))
            })
            .collect();

        SyncAgent {
            config: Arc::new(config),
            db,
            engines,
            publisher,
            connectivity,
        }
    }

    /// Registers an observer before the agent starts.
    pub fn with_observer(self, observer: Arc<dyn SyncStateObserver>) -> Self {
        self.publisher.subscribe(observer);
        self
    }

    pub fn engine(&self, store_id: &str) -> Option<&Arc<SyncEngine>> {
        self.engines.get(store_id)
    }

    /// Submit/read entry point for a store.
    pub fn gateway(&self, store_id: &str) -> SyncResult<Gateway> {
        self.engines
            .get(store_id)
            .map(|engine| Gateway::new(engine.clone()))
            .ok_or_else(|| SyncError::UnknownStore(store_id.to_string()))
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Starts the run loop and returns a handle to it.
    pub fn spawn(self) -> SyncAgentHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = SyncAgentHandle {
            command_tx,
            shutdown_tx,
            engines: Arc::new(self.engines.clone()),
            publisher: self.publisher.clone(),
            connectivity: self.connectivity.clone(),
        };

        info!(
            device_id = %self.config.device.id,
            stores = ?handle.stores(),
            "Starting sync agent"
        );
        tokio::spawn(self.run(command_rx, shutdown_rx));
        handle
    }

    async fn run(
        self,
        mut command_rx: mpsc::Receiver<AgentCommand>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoffs: HashMap<String, StoreBackoff> = self
            .engines
            .keys()
            .map(|s| (s.clone(), StoreBackoff::new(&self.config)))
            .collect();

        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<PassFinished>();

        // Stores that were asked to sync while a pass was running.
        let mut rerun: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let now = Instant::now();
                    for (store_id, engine) in &self.engines {
                        let ready = backoffs.get(store_id).map_or(true, |b| b.ready(now));
                        if ready {
                            Self::spawn_pass(engine.clone(), SyncTrigger::Interval, finished_tx.clone());
                        } else {
                            debug!(store_id = %store_id, "Backing off, poll skipped");
                        }
                    }
                }

                _ = maintenance.tick() => {
                    self.run_maintenance().await;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        AgentCommand::Sync { store_id, trigger } => {
                            let targets: Vec<&Arc<SyncEngine>> = match &store_id {
                                Some(id) => self.engines.get(id).into_iter().collect(),
                                None => self.engines.values().collect(),
                            };
                            for engine in targets {
                                if let Some(b) = backoffs.get_mut(engine.store_id()) {
                                    b.reset();
                                }
                                Self::spawn_pass(engine.clone(), trigger, finished_tx.clone());
                            }
                        }
                        AgentCommand::SetOnline(online) => {
                            let was_online = self.connectivity.set_online(online);
                            info!(online, "Connectivity changed");
                            if online && !was_online {
                                for engine in self.engines.values() {
                                    if let Some(b) = backoffs.get_mut(engine.store_id()) {
                                        b.reset();
                                    }
                                    Self::spawn_pass(engine.clone(), SyncTrigger::Reconnect, finished_tx.clone());
                                }
                            }
                        }
                    }
                }

                Some(finished) = finished_rx.recv() => {
                    let Some(engine) = self.engines.get(&finished.store_id) else {
                        continue;
                    };
                    match finished.result {
                        PassResult::Skipped => {
                            if engine.is_running() {
                                rerun.insert(finished.store_id);
                            } else {
                                Self::spawn_pass(engine.clone(), SyncTrigger::Manual, finished_tx.clone());
                            }
                        }
                        PassResult::Aborted => {
                            rerun.remove(&finished.store_id);
                            if let Some(b) = backoffs.get_mut(&finished.store_id) {
                                let delay = b.on_aborted(Instant::now());
                                warn!(store_id = %finished.store_id, ?delay, "Pass aborted, backing off");
                            }
                        }
                        PassResult::Completed => {
                            if let Some(b) = backoffs.get_mut(&finished.store_id) {
                                b.reset();
                            }
                            if rerun.remove(&finished.store_id) {
                                Self::spawn_pass(engine.clone(), SyncTrigger::Manual, finished_tx.clone());
                            }
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync agent shutting down");
                    break;
                }
            }
        }
    }

    fn spawn_pass(
        engine: Arc<SyncEngine>,
        trigger: SyncTrigger,
        finished_tx: mpsc::UnboundedSender<PassFinished>,
    ) {
        tokio::spawn(async move {
            debug!(store_id = %engine.store_id(), %trigger, "Pass requested");
            let result = match engine.run_pass().await {
                Ok(PassOutcome::AlreadyRunning) => PassResult::Skipped,
                Ok(PassOutcome::Aborted(_)) => PassResult::Aborted,
                Ok(PassOutcome::Completed(_)) => PassResult::Completed,
                Err(e) => {
                    error!(store_id = %engine.store_id(), error = %e, "Pass failed");
                    PassResult::Aborted
                }
            };
            let _ = finished_tx.send(PassFinished {
                store_id: engine.store_id().to_string(),
                result,
            });
        });
    }

    async fn run_maintenance(&self) {
        match self.db.cache().purge_expired().await {
            Ok(purged) if purged > 0 => debug!(purged, "Purged expired cache entries"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Cache purge failed"),
        }
        match self
            .db
            .mutations()
            .cleanup_completed(self.config.sync.cleanup_after_days)
            .await
        {
            Ok(removed) if removed > 0 => debug!(removed, "Removed old completed operations"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Mutation log cleanup failed"),
        }
    }
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Cloneable control handle of a running agent.
#[derive(Clone)]
pub struct SyncAgentHandle {
    command_tx: mpsc::Sender<AgentCommand>,
    shutdown_tx: mpsc::Sender<()>,
    engines: Arc<HashMap<String, Arc<SyncEngine>>>,
    publisher: Arc<StatePublisher>,
    connectivity: Connectivity,
}

impl SyncAgentHandle {
    /// Requests a pass for one store.
    pub async fn request_sync(&self, store_id: &str, trigger: SyncTrigger) -> SyncResult<()> {
        if !self.engines.contains_key(store_id) {
            return Err(SyncError::UnknownStore(store_id.to_string()));
        }
        self.send(AgentCommand::Sync {
            store_id: Some(store_id.to_string()),
            trigger,
        })
        .await
    }

    /// Requests a pass for every store.
    pub async fn sync_all(&self, trigger: SyncTrigger) -> SyncResult<()> {
        self.send(AgentCommand::Sync {
            store_id: None,
            trigger,
        })
        .await
    }

    /// Connectivity notification. Going online triggers a reconnect pass.
    pub async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.send(AgentCommand::SetOnline(online)).await
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Configured stores, sorted.
    pub fn stores(&self) -> Vec<String> {
        let mut stores: Vec<String> = self.engines.keys().cloned().collect();
        stores.sort();
        stores
    }

    /// Submit/read entry point for a store.
    pub fn gateway(&self, store_id: &str) -> SyncResult<Gateway> {
        self.engines
            .get(store_id)
            .map(|engine| Gateway::new(engine.clone()))
            .ok_or_else(|| SyncError::UnknownStore(store_id.to_string()))
    }

    /// Latest published state of a store.
    pub fn snapshot(&self, store_id: &str) -> SyncSnapshot {
        self.publisher.snapshot(store_id)
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Signals the agent to stop. Passes already running finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn send(&self, command: AgentCommand) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_triggers() {
        assert!(SyncTrigger::Manual.is_explicit());
        assert!(SyncTrigger::Reconnect.is_explicit());
        assert!(SyncTrigger::Login.is_explicit());
        assert!(!SyncTrigger::Interval.is_explicit());
        assert_eq!(SyncTrigger::Login.to_string(), "login");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_backoff_grows_and_resets() {
        let mut config = SyncConfig::default();
        config.sync.initial_backoff_ms = 1000;
        config.sync.max_backoff_secs = 4;
        let mut backoff = StoreBackoff::new(&config);

        let now = Instant::now();
        assert!(backoff.ready(now));

        let first = backoff.on_aborted(now);
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + first));

        for _ in 0..5 {
            assert!(backoff.on_aborted(now) <= Duration::from_secs(4));
        }

        backoff.reset();
        assert!(backoff.ready(now));
    }
}
