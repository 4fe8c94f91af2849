//! Integration tests for the role HTTP endpoints
//!
//! Full request/response cycles through the router, backed by a file store
//! in a temp directory and the scripted remote fake.

mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use conductor::api::{self, ApiState};
use conductor::app_state::{spawn_aggregator, AppState};
use conductor::remote::{RemoteActor, Role};
use conductor::store::{bootstrap, DocumentStore, SqliteDocumentStore};
use shared_types::{Blob, ComputeRequest, SelectTargetsRequest, TargetProfile, Value as Cell};
use support::FakeRemote;

struct TestApp {
    router: axum::Router,
    remote: Arc<FakeRemote>,
    _temp_dir: tempfile::TempDir,
}

async fn setup_test_app(with_pool: bool) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("conductor.db");
    let store = SqliteDocumentStore::connect(db_path.to_str().expect("Invalid database path"))
        .await
        .expect("Failed to open store");
    bootstrap(&store).await.expect("Failed to bootstrap store");
    let store: Arc<dyn DocumentStore> = Arc::new(store);

    let remote = Arc::new(FakeRemote::new(store.clone()));
    let dyn_remote: Arc<dyn RemoteActor> = remote.clone();
    let aggregator = if with_pool {
        Some(
            spawn_aggregator(dyn_remote.clone(), 2, 3)
                .await
                .expect("Failed to spawn aggregator"),
        )
    } else {
        None
    };

    let state = ApiState {
        app_state: AppState::start(store, dyn_remote, "api-node", aggregator)
            .await
            .expect("Failed to start conductor actor"),
        roles: Role::ALL.to_vec(),
    };
    TestApp {
        router: api::router(&Role::ALL).with_state(state),
        remote,
        _temp_dir: temp_dir,
    }
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(&body).to_string();
        json!({
            "error": {
                "message": text
            }
        })
    });
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn sum_submission(concept: &str) -> Value {
    json!({
        "concepts": [concept],
        "target_profile": {"type": 0, "value": concept},
        "local_query": {"select": ["x"]},
        "layers": [
            {"size": 3, "jobs": [{"function": "sum", "args": {"key": "x"}}]},
            {"size": 1, "jobs": [{"function": "sum", "args": {"key": "sum_x", "output": "total"}}]}
        ]
    })
}

async fn register(app: &axum::Router, concept: &str, addresses: &[&str]) {
    let (status, _) = json_response(
        app,
        post(
            "/target/subscribers",
            json!({"concept": support::hash(concept), "addresses": addresses}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

/// First call the worker made back to the conductor role.
async fn first_report(app: &TestApp) -> (Role, String, Value) {
    for _ in 0..50 {
        let reported = app
            .remote
            .calls
            .lock()
            .unwrap()
            .iter()
            .find(|(role, _, _)| *role == Role::Conductor)
            .cloned();
        if let Some(reported) = reported {
            return reported;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("worker never reported");
}

/// Submit a three-unit sum and install 60 rows, leaving layer 0 dispatched.
async fn dispatched_query(app: &TestApp) -> String {
    register(&app.router, "cooking", &["alice"]).await;
    let (_, body) =
        json_response(&app.router, post("/conductor/queries", sum_submission("cooking"))).await;
    let query_id = body["query_id"].as_str().unwrap().to_string();

    for _ in 0..50 {
        if app.remote.count(Role::Data) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (status, body) = json_response(
        &app.router,
        post(
            &format!("/conductor/queries/{query_id}/local-results"),
            json!({ "rows": support::rows(60) }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lead"]["status"], "layer_dispatched");
    query_id
}

#[tokio::test]
async fn test_health_lists_hosted_roles() {
    let app = setup_test_app(false).await;
    let (status, body) = json_response(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["roles"].as_array().unwrap().len(), Role::ALL.len());
}

#[tokio::test]
async fn test_submit_rejects_invalid_layers() {
    let app = setup_test_app(false).await;
    let mut submission = sum_submission("cooking");
    submission["layers"][1]["size"] = json!(2);

    let (status, body) = json_response(&app.router, post("/conductor/queries", submission)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("size 1"));
}

#[tokio::test]
async fn test_submit_and_get_query() {
    let app = setup_test_app(false).await;
    let (status, body) =
        json_response(&app.router, post("/conductor/queries", sum_submission("cooking"))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "submitted");
    let query_id = body["query_id"].as_str().unwrap().to_string();

    let (status, body) =
        json_response(&app.router, get(&format!("/conductor/queries/{query_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], query_id.as_str());
    assert_eq!(body["layers"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_query_is_not_found() {
    let app = setup_test_app(false).await;
    let (status, body) =
        json_response(&app.router, get("/conductor/queries/does-not-exist")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_unit_result_is_not_found() {
    let app = setup_test_app(false).await;
    let (status, body) = json_response(
        &app.router,
        post(
            "/conductor/queries/nope/layers/0/units/0/result",
            json!({"result": {"sum_x": 1.0}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_target_select_evaluates_profile() {
    let app = setup_test_app(false).await;
    let lists = json!({
        "cooking": ["joel", "claire", "caroline"],
        "hiking": ["paul", "claire"]
    });
    let profile = TargetProfile::intersection(
        TargetProfile::single("cooking"),
        TargetProfile::single("hiking"),
    );
    let request = SelectTargetsRequest {
        query_id: "q-1".into(),
        lists: Blob::from_json(&lists).unwrap(),
        profile: Blob::from_json(&profile).unwrap(),
    };

    let (status, body) = json_response(
        &app.router,
        post("/target/select", serde_json::to_value(&request).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let targets: Blob = serde_json::from_value(body["targets"].clone()).unwrap();
    let targets: Vec<String> = targets.to_json().unwrap();
    assert_eq!(targets, vec!["claire"]);
}

#[tokio::test]
async fn test_target_select_unknown_list() {
    let app = setup_test_app(false).await;
    let request = SelectTargetsRequest {
        query_id: "q-1".into(),
        lists: Blob::from_json(&json!({"cooking": ["joel"]})).unwrap(),
        profile: Blob::from_json(&TargetProfile::single("sailing")).unwrap(),
    };

    let (status, body) = json_response(
        &app.router,
        post("/target/select", serde_json::to_value(&request).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"]["message"].as_str().unwrap().contains("sailing"));
}

#[tokio::test]
async fn test_compute_without_pool_is_unavailable() {
    let app = setup_test_app(false).await;
    let request = ComputeRequest {
        query_id: "q-1".into(),
        layer: 0,
        unit: 0,
        rows: support::rows(3),
        jobs: vec![shared_types::AggregationJob::new("sum").arg("key", "x")],
    };

    let (status, body) = json_response(
        &app.router,
        post("/aggregator/compute", serde_json::to_value(&request).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "ACTOR_NOT_AVAILABLE");
}

#[tokio::test]
async fn test_compute_is_acknowledged_then_reported() {
    let app = setup_test_app(true).await;
    let request = ComputeRequest {
        query_id: "q-1".into(),
        layer: 0,
        unit: 2,
        rows: support::rows(4),
        jobs: vec![shared_types::AggregationJob::new("sum").arg("key", "x")],
    };

    let (status, body) = json_response(
        &app.router,
        post("/aggregator/compute", serde_json::to_value(&request).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert!(body["arrived_at"].is_string());

    // The worker reports back to the conductor role asynchronously.
    let (_, mode, body) = first_report(&app).await;
    assert_eq!(mode, "queries/q-1/layers/0/units/2/result");
    assert_eq!(body["result"]["sum_x"], 6.0);
}

#[tokio::test]
async fn test_http_pipeline_end_to_end() {
    let app = setup_test_app(false).await;
    register(&app.router, "cooking", &["alice", "bob"]).await;

    let (_, body) =
        json_response(&app.router, post("/conductor/queries", sum_submission("cooking"))).await;
    let query_id = body["query_id"].as_str().unwrap().to_string();

    // Wait for the background lead to reach the local query.
    let mut dispatched = false;
    for _ in 0..50 {
        if app.remote.count(Role::Data) == 1 {
            dispatched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dispatched, "local query never dispatched");

    let (status, body) = json_response(
        &app.router,
        get(&format!("/conductor/queries/{query_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checkpoints"]["tf"], true);

    let rows = support::rows(60);
    let (status, body) = json_response(
        &app.router,
        post(
            &format!("/conductor/queries/{query_id}/local-results"),
            json!({ "rows": rows }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["lead"]["status"], "layer_dispatched");
    assert_eq!(body["lead"]["layer"], 0);

    let (_, body) = json_response(
        &app.router,
        post(
            &format!("/conductor/queries/{query_id}/local-results"),
            json!({ "rows": [] }),
        ),
    )
    .await;
    assert_eq!(body["status"], "already_completed");

    // Play the worker over HTTP until the query finishes.
    let mut handled = 0;
    for _ in 0..4 {
        let requests = app.remote.compute_requests();
        for request in &requests[handled..] {
            let result =
                conductor::aggregation::run_jobs(&request.rows, &request.jobs).unwrap();
            let (status, _) = json_response(
                &app.router,
                post(
                    &format!(
                        "/conductor/queries/{query_id}/layers/{}/units/{}/result",
                        request.layer, request.unit
                    ),
                    json!({ "result": result }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        handled = requests.len();
    }
    assert_eq!(handled, 4);

    let (_, body) = json_response(
        &app.router,
        get(&format!("/conductor/queries/{query_id}")),
    )
    .await;
    assert_eq!(body["checkpoints"]["da"], true);
    assert_eq!(body["results"]["total"], 1770.0);

    let (status, body) = json_response(
        &app.router,
        get(&format!("/conductor/queries/{query_id}/metadata")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["ended_at"].is_string());
    assert_eq!(body["stages"]["finish"]["host"], "api-node");

    let (_, body) = json_response(
        &app.router,
        post(&format!("/conductor/queries/{query_id}/lead"), json!({})),
    )
    .await;
    assert_eq!(body["status"], "finished");
}

#[tokio::test]
async fn test_compute_with_mismatched_rows_reports_unit_failure() {
    let app = setup_test_app(true).await;
    let request = ComputeRequest {
        query_id: "q-1".into(),
        layer: 0,
        unit: 1,
        rows: vec![[("x".to_string(), Cell::Text("oops".into()))]
            .into_iter()
            .collect()],
        jobs: vec![shared_types::AggregationJob::new("sum").arg("key", "x")],
    };

    let (status, _) = json_response(
        &app.router,
        post("/aggregator/compute", serde_json::to_value(&request).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, mode, body) = first_report(&app).await;
    assert_eq!(mode, "queries/q-1/layers/0/units/1/failure");
    assert!(body["reason"].as_str().unwrap().contains("x"));
}

#[tokio::test]
async fn test_unit_failure_is_recorded_and_redispatched() {
    let app = setup_test_app(false).await;
    let query_id = dispatched_query(&app).await;
    assert_eq!(app.remote.compute_requests().len(), 3);

    let (status, body) = json_response(
        &app.router,
        post(
            &format!("/conductor/queries/{query_id}/layers/0/units/1/failure"),
            json!({"reason": "type mismatch on `x`"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "failure_recorded"}));

    let (_, metadata) = json_response(
        &app.router,
        get(&format!("/conductor/queries/{query_id}/metadata")),
    )
    .await;
    assert_eq!(
        metadata["stages"]["layer_0_unit_1"]["error"],
        "type mismatch on `x`"
    );

    let (_, body) = json_response(
        &app.router,
        post(&format!("/conductor/queries/{query_id}/lead"), json!({})),
    )
    .await;
    assert_eq!(body["status"], "layer_dispatched");
    let requests = app.remote.compute_requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[3].unit, 1);
}

#[tokio::test]
async fn test_unknown_unit_failure_is_not_found() {
    let app = setup_test_app(false).await;
    let (status, body) = json_response(
        &app.router,
        post(
            "/conductor/queries/nope/layers/0/units/0/failure",
            json!({"reason": "boom"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
