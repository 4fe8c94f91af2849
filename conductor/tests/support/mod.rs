//! Shared fixtures: in-memory store and a scripted remote-actor fake.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use shared_types::{
    AggregationJob, ComputeRequest, ConceptLookupRequest, Layer, Query, QueryId, QuerySubmission,
    Row, SelectTargetsRequest, Subscriber, TargetProfile, Value,
};

use conductor::actors::conductor::Conductor;
use conductor::actors::target::TargetService;
use conductor::remote::{RemoteActor, RemoteError, Role};
use conductor::store::{
    bootstrap, Collection, DocumentStore, Namespace, SqliteDocumentStore, QUERIES_TABLE,
};

/// Answers concept and target calls itself, records data and aggregator
/// calls for the test to inspect.
pub struct FakeRemote {
    target: TargetService,
    failing: Mutex<HashSet<Role>>,
    budgets: Mutex<HashMap<Role, usize>>,
    accepted: Mutex<Vec<ComputeRequest>>,
    pub calls: Mutex<Vec<(Role, String, Json)>>,
}

impl FakeRemote {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            target: TargetService::new(store),
            failing: Mutex::new(HashSet::new()),
            budgets: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, role: Role) {
        self.failing.lock().unwrap().insert(role);
    }

    /// Let `calls` more calls to `role` succeed, then fail the rest.
    pub fn fail_after(&self, role: Role, calls: usize) {
        self.budgets.lock().unwrap().insert(role, calls);
    }

    pub fn recover(&self, role: Role) {
        self.failing.lock().unwrap().remove(&role);
        self.budgets.lock().unwrap().remove(&role);
    }

    pub fn count(&self, role: Role) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| *r == role)
            .count()
    }

    /// Every compute request accepted so far, in arrival order. Calls that
    /// were answered with an error are left out.
    pub fn compute_requests(&self) -> Vec<ComputeRequest> {
        self.accepted.lock().unwrap().clone()
    }

    fn refuses(&self, role: Role) -> bool {
        if self.refuses(role) {
            return true;
        }
        match self.budgets.lock().unwrap().get_mut(&role) {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl RemoteActor for FakeRemote {
    async fn call(&self, role: Role, mode: &str, body: Json) -> Result<Json, RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push((role, mode.to_string(), body.clone()));

        if self.refuses(role) {
            return Err(RemoteError::Upstream {
                status: 503,
                errors: vec![format!("{role} unavailable")],
            });
        }

        match (role, mode) {
            (Role::Concept, "lookup") => {
                let request: ConceptLookupRequest = serde_json::from_value(body).unwrap();
                let hashes: Vec<String> = request.concepts.iter().map(|c| hash(c)).collect();
                Ok(json!({ "hashes": hashes }))
            }
            (Role::Target, "select") => {
                let request: SelectTargetsRequest = serde_json::from_value(body).unwrap();
                let response = self
                    .target
                    .select(&request)
                    .map_err(|e| RemoteError::Upstream {
                        status: 404,
                        errors: vec![e.to_string()],
                    })?;
                Ok(serde_json::to_value(response).unwrap())
            }
            (Role::Data, "query") => Ok(json!({ "status": "queued" })),
            (Role::Aggregator, "compute") => {
                let request: ComputeRequest = serde_json::from_value(body).unwrap();
                self.accepted.lock().unwrap().push(request);
                Ok(json!({
                    "status": "accepted",
                    "arrived_at": chrono::Utc::now(),
                }))
            }
            _ => Ok(Json::Null),
        }
    }
}

pub fn hash(concept: &str) -> String {
    format!("hash-{concept}")
}

pub struct Harness {
    pub store: Arc<dyn DocumentStore>,
    pub remote: Arc<FakeRemote>,
    pub conductor: Conductor,
    pub target: TargetService,
}

pub async fn harness() -> Harness {
    let store = SqliteDocumentStore::in_memory().await.unwrap();
    bootstrap(&store).await.unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(store);
    let remote = Arc::new(FakeRemote::new(store.clone()));
    Harness {
        conductor: Conductor::new(store.clone(), remote.clone(), "test-node"),
        target: TargetService::new(store.clone()),
        store,
        remote,
    }
}

impl Harness {
    pub async fn subscribe(&self, concept: &str, addresses: &[&str]) {
        self.target
            .register(Subscriber {
                concept: hash(concept),
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
            })
            .await
            .unwrap();
    }

    /// Mark `t` and install layer-0 rows straight in the store, without
    /// leading.
    pub async fn install_rows(&self, id: &QueryId, rows: Vec<Row>) {
        let queries: Collection<Query> =
            Collection::new(self.store.clone(), Namespace::Conductor, QUERIES_TABLE);
        let mut query = queries.get(id.as_str()).await.unwrap();
        query.doc.layers[0].data = rows;
        query
            .doc
            .checkpoints
            .mark(shared_types::Checkpoint::LocalQueryCompleted);
        queries.update(&mut query).await.unwrap();
    }

    /// Play the worker: compute every not-yet-handled request and report it.
    pub async fn run_units(&self, requests: &[ComputeRequest]) {
        for request in requests {
            let result = conductor::aggregation::run_jobs(&request.rows, &request.jobs).unwrap();
            self.conductor
                .record_unit_result(&request.query_id, request.layer, request.unit, result)
                .await
                .unwrap();
        }
    }
}

pub fn rows(n: i64) -> Vec<Row> {
    (0..n)
        .map(|i| [("x".to_string(), Value::Int(i))].into_iter().collect())
        .collect()
}

/// Two-layer sum: per-fold `sum_x` then a single total.
pub fn sum_layers(first_size: usize) -> Vec<Layer> {
    vec![
        Layer {
            size: first_size,
            jobs: vec![AggregationJob::new("sum").arg("key", "x")],
            data: Vec::new(),
        },
        Layer {
            size: 1,
            jobs: vec![AggregationJob::new("sum")
                .arg("key", "sum_x")
                .arg("output", "total")],
            data: Vec::new(),
        },
    ]
}

pub fn submission(concepts: &[&str], profile: TargetProfile, layers: Vec<Layer>) -> QuerySubmission {
    QuerySubmission {
        concepts: concepts.iter().map(|c| c.to_string()).collect(),
        target_profile: profile,
        local_query: json!({"select": ["x"]}),
        layers,
    }
}
