//! In-process stand-in for the authoritative server.
//!
//! Honors the backend contract the engine relies on: deduplicates by
//! idempotency token, serves a timestamp-filtered change feed, and returns
//! the full resource on every successful mutation.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use till_core::{
    AncillaryEvent, ChangeSet, HttpMethod, MutationKind, MutationLogEntry, NewMutation, RecordChange,
    ReplayRequest, ResourceKind, StockMovementChange,
};
use till_db::{Database, DbConfig};
use till_sync::{
    Gateway, HttpRequest, HttpResponse, StatePublisher, SyncConfig, SyncEngine, SyncTransport,
    TransportError,
};

pub const STORE: &str = "s1";
pub const CHANGES_PATH: &str = "/sync/changes";

/// Path segments that name an action on the parent resource.
const ACTIONS: &[&str] = &["confirm", "close", "void"];

/// `2024-05-01T10:00:00Z` plus `secs`.
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
}

/// How a request should fail.
#[derive(Debug, Clone)]
pub enum Failure {
    Status(u16, &'static str),
    Unreachable,
    /// The server applies the operation but the reply is lost.
    LostReply,
}

#[derive(Default)]
struct State {
    next_id: u64,
    offline: bool,
    clock: Option<DateTime<Utc>>,
    resources: BTreeMap<String, Value>,
    replies: HashMap<String, HttpResponse>,
    effects: Vec<String>,
    calls: Vec<HttpRequest>,
    failures: Vec<(String, Failure)>,
    records: Vec<RecordChange>,
    movements: Vec<StockMovementChange>,
    events: Vec<AncillaryEvent>,
}

pub struct FakeServer {
    state: Mutex<State>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub entered: Notify,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeServer {
            state: Mutex::new(State {
                next_id: 1000,
                ..Default::default()
            }),
            gate: Mutex::new(None),
            entered: Notify::new(),
        })
    }

    // ---- setup -------------------------------------------------------------

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_clock(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().clock = Some(at);
    }

    /// Makes every request whose path starts with `prefix` fail.
    pub fn fail(&self, prefix: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((prefix.to_string(), failure));
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn seed(&self, path: &str, value: Value) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(path.to_string(), value);
    }

    pub fn push_record(&self, kind: ResourceKind, id: &str, data: Value, at: DateTime<Utc>) {
        self.state.lock().unwrap().records.push(RecordChange {
            kind,
            id: id.to_string(),
            deleted: false,
            data,
            updated_at: at,
        });
    }

    pub fn push_deletion(&self, kind: ResourceKind, id: &str, at: DateTime<Utc>) {
        self.state.lock().unwrap().records.push(RecordChange {
            kind,
            id: id.to_string(),
            deleted: true,
            data: Value::Null,
            updated_at: at,
        });
    }

    pub fn push_movement(&self, id: &str, product_id: &str, delta: i64, at: DateTime<Utc>) {
        self.state.lock().unwrap().movements.push(StockMovementChange {
            id: id.to_string(),
            product_id: product_id.to_string(),
            quantity_delta: delta,
            reason: None,
            occurred_at: at,
        });
    }

    /// Holds every request until permits are added to the returned gate.
    pub fn install_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    // ---- inspection --------------------------------------------------------

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Non-GET requests that reached the server.
    pub fn mutating_calls(&self) -> Vec<HttpRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != HttpMethod::Get)
            .collect()
    }

    /// `"METHOD /path"` for every operation applied, once per token.
    pub fn effects(&self) -> Vec<String> {
        self.state.lock().unwrap().effects.clone()
    }

    pub fn resource(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().resources.get(path).cloned()
    }

    pub fn resource_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .resources
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }

    // ---- behaviour ---------------------------------------------------------

    fn changes(state: &State, request: &HttpRequest) -> HttpResponse {
        let since = request
            .query_param("since")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let newer = |at: DateTime<Utc>| since.map_or(true, |s| at > s);

        let set = ChangeSet {
            stock_movements: state
                .movements
                .iter()
                .filter(|m| newer(m.occurred_at))
                .cloned()
                .collect(),
            records: state
                .records
                .iter()
                .filter(|r| newer(r.updated_at))
                .cloned()
                .collect(),
            events: state
                .events
                .iter()
                .filter(|e| newer(e.occurred_at))
                .cloned()
                .collect(),
            server_time: state.clock.unwrap_or_else(|| t(10_000)),
        };
        HttpResponse::new(200, Some(serde_json::to_value(set).unwrap()))
    }

    fn apply(state: &mut State, request: &HttpRequest) -> HttpResponse {
        let path = request.path.trim_end_matches('/').to_string();
        let (parent, last) = path.rsplit_once('/').unwrap_or(("", path.as_str()));

        match request.method {
            HttpMethod::Get => match state.resources.get(&path) {
                Some(v) => HttpResponse::new(200, Some(v.clone())),
                None => not_found(&path),
            },
            HttpMethod::Post if ACTIONS.contains(&last) => match state.resources.get_mut(parent) {
                Some(resource) => {
                    resource["status"] = json!(format!("{}ed", last.trim_end_matches('e')));
                    HttpResponse::new(200, Some(resource.clone()))
                }
                None => not_found(parent),
            },
            HttpMethod::Post => {
                state.next_id += 1;
                let id = state.next_id.to_string();
                let mut body = match request.body.clone() {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                body.insert("id".into(), json!(id));
                let body = Value::Object(body);
                state.resources.insert(format!("{}/{}", path, id), body.clone());
                HttpResponse::new(201, Some(body))
            }
            HttpMethod::Put | HttpMethod::Patch => match state.resources.get_mut(&path) {
                Some(resource) => {
                    if let (Some(target), Some(Value::Object(fields))) =
                        (resource.as_object_mut(), request.body.as_ref())
                    {
                        for (k, v) in fields {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                    HttpResponse::new(200, Some(resource.clone()))
                }
                None => not_found(&path),
            },
            HttpMethod::Delete => match state.resources.remove(&path) {
                Some(_) => HttpResponse::new(200, Some(json!({ "id": last, "deleted": true }))),
                None => not_found(&path),
            },
        }
    }
}

fn not_found(path: &str) -> HttpResponse {
    HttpResponse::new(404, Some(json!({ "message": format!("{} not found", path) })))
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.acquire().await.unwrap().forget();
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(request.clone());

        if state.offline {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let failure = state
            .failures
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
            .map(|(_, f)| f.clone());

        match &failure {
            Some(Failure::Unreachable) => {
                return Err(TransportError::Connect("connection reset".into()))
            }
            Some(Failure::Status(status, message)) => {
                return Ok(HttpResponse::new(*status, Some(json!({ "message": message }))))
            }
            _ => {}
        }

        if request.method == HttpMethod::Get && request.path == CHANGES_PATH {
            return Ok(Self::changes(&state, &request));
        }

        let response = match request.header("Idempotency-Key").map(String::from) {
            Some(token) => match state.replies.get(&token) {
                Some(previous) => previous.clone(),
                None => {
                    let response = Self::apply(&mut state, &request);
                    if response.is_success() {
                        state
                            .effects
                            .push(format!("{} {}", request.method, request.path));
                    }
                    state.replies.insert(token, response.clone());
                    response
                }
            },
            None => Self::apply(&mut state, &request),
        };

        if matches!(failure, Some(Failure::LostReply)) {
            return Err(TransportError::Timeout);
        }
        Ok(response)
    }
}

// ---- engine fixtures -------------------------------------------------------

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.device.id = "test-device".into();
    config.store.id = STORE.into();
    config.server.base_url = "http://server.test".into();
    config.server.changes_path = CHANGES_PATH.into();
    config
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub db: Database,
    pub engine: Arc<SyncEngine>,
    pub gateway: Gateway,
    pub publisher: Arc<StatePublisher>,
}

pub async fn harness() -> Harness {
    let server = FakeServer::new();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let publisher = Arc::new(StatePublisher::new());
    let engine = Arc::new(SyncEngine::new(
        STORE,
        db.clone(),
        server.clone(),
        &config(),
        publisher.clone(),
    ));
    Harness {
        gateway: Gateway::new(engine.clone()),
        server,
        db,
        engine,
        publisher,
    }
}

impl Harness {
    /// Queues a mutation as if it had been recorded offline at `at`.
    pub async fn queue(&self, mutation: NewMutation, at: DateTime<Utc>) -> MutationLogEntry {
        self.db.mutations().enqueue_at(&mutation, at).await.unwrap()
    }

    pub async fn entry(&self, id: i64) -> MutationLogEntry {
        self.db.mutations().get(id).await.unwrap().unwrap()
    }
}

// ---- mutation builders -----------------------------------------------------

pub fn create_sale(local_id: &str, body: Value) -> NewMutation {
    NewMutation::new(
        STORE,
        ResourceKind::Sale,
        local_id,
        MutationKind::Create,
        ReplayRequest::new(HttpMethod::Post, "/sales").with_body(body),
    )
}

pub fn add_item(sale_id: &str, local_item: &str, product: &str, qty: i64) -> NewMutation {
    NewMutation::new(
        STORE,
        ResourceKind::SaleItem,
        local_item,
        MutationKind::Create,
        ReplayRequest::new(HttpMethod::Post, &format!("/sales/{}/items", sale_id))
            .with_body(json!({
                "sale_id": sale_id,
                "product_id": product,
                "qty": qty,
                "note": format!("added to {}", sale_id)
            }))
            .with_body_ref("/sale_id"),
    )
}

pub fn confirm_sale(sale_id: &str) -> NewMutation {
    NewMutation::new(
        STORE,
        ResourceKind::Sale,
        sale_id,
        MutationKind::ConfirmSale,
        ReplayRequest::new(HttpMethod::Post, &format!("/sales/{}/confirm", sale_id)),
    )
}

pub fn update_product(id: &str, body: Value) -> NewMutation {
    NewMutation::new(
        STORE,
        ResourceKind::Product,
        id,
        MutationKind::Update,
        ReplayRequest::new(HttpMethod::Patch, &format!("/products/{}", id)).with_body(body),
    )
}

pub fn delete_sale(sale_id: &str) -> NewMutation {
    NewMutation::new(
        STORE,
        ResourceKind::Sale,
        sale_id,
        MutationKind::Delete,
        ReplayRequest::new(HttpMethod::Delete, &format!("/sales/{}", sale_id)),
    )
}
