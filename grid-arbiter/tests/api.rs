mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{Harness, settings};
use grid_arbiter::api::{AppState, create_router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tower::ServiceExt;

fn router(harness: &Harness) -> Router {
    create_router(Arc::new(AppState {
        jobs: harness.manager.clone(),
        counters: harness.counters.clone(),
    }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn new_job_body(id: &str, cores: f64) -> Value {
    json!({
        "id": id,
        "expirationInSeconds": 60,
        "resources": { "cores": cores, "threads": 0, "memory_mb": 0 },
        "waitForReadyInstance": false
    })
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);

    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    assert_eq!(body["gridServerVersion"], "1.0");
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);

    let (status, body) = send(&app, "POST", "/jobs", Some(new_job_body("abc", 1.0))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "abc");
    assert_eq!(body["port"], 45000);

    let (status, body) = send(&app, "POST", "/jobs", Some(new_job_body("abc", 1.0))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("abc"));

    let (_, body) = send(&app, "GET", "/jobs", None).await;
    assert_eq!(body, json!(["abc"]));

    let (status, body) = send(&app, "GET", "/jobs/abc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instanceName"], "GridServer:45000");

    let (status, _) = send(
        &app,
        "POST",
        "/jobs/abc/renew",
        Some(json!({ "expirationInSeconds": 120 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, "GET", "/resources", None).await;
    assert_eq!(body["allocatedPhysicalCores"], 1.0);

    let (status, _) = send(&app, "DELETE", "/jobs/abc", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/jobs/abc", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(harness.manager.get_active_jobs_count(), 0);
}

#[tokio::test]
async fn test_execute_runs_command_in_job() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);
    send(&app, "POST", "/jobs", Some(new_job_body("abc", 1.0))).await;

    let (status, body) = send(
        &app,
        "POST",
        "/jobs/abc/execute",
        Some(json!({ "scriptType": "Ping", "arguments": { "count": 1 } })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert!(harness.provider.created(0).rpc.calls().contains(&"Execute:abc".to_string()));

    harness.provider.created(0).rpc.fail_execute.store(true, Ordering::SeqCst);
    let (status, _) = send(
        &app,
        "POST",
        "/jobs/abc/execute",
        Some(json!({ "scriptType": "Ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_rejections_map_to_status_codes() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);

    let (status, body) = send(&app, "POST", "/jobs", Some(new_job_body("huge", 64.0))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("cpu allocation exceeded"));

    let (status, _) = send(&app, "POST", "/jobs", Some(new_job_body("  ", 1.0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/jobs/ghost/renew",
        Some(json!({ "expirationInSeconds": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_negative_resources_are_a_bad_request() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);

    let (status, body) = send(&app, "POST", "/jobs", Some(new_job_body("neg", -4.0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cores must not be negative"));

    let (status, _) = send(&app, "POST", "/jobs", Some(new_job_body("six", 6.0))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(harness.manager.get_allocated_resource().is_zero());

    let (status, _) = send(
        &app,
        "POST",
        "/instances/update",
        Some(json!({
            "id": "neg",
            "game_id": null,
            "container_id": null,
            "scheduler_cpu_period": 100000,
            "maximum_cores": 1.0,
            "maximum_threads": -8,
            "maximum_memory_in_megabytes": 0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_instances_and_metrics() {
    let harness = Harness::start(settings()).await;
    let app = router(&harness);
    send(&app, "POST", "/jobs", Some(new_job_body("abc", 1.0))).await;

    let (status, body) = send(&app, "GET", "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["job_id"], "abc");
    assert_eq!(body[0]["breaker_tripped"], false);

    let (status, body) = send(
        &app,
        "POST",
        "/instances/update",
        Some(json!({
            "id": "abc",
            "game_id": null,
            "container_id": null,
            "scheduler_cpu_period": 100000,
            "maximum_cores": 2.0,
            "maximum_threads": 8,
            "maximum_memory_in_megabytes": 512
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], "abc");

    let (_, body) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(body["JobManager.NewJob.Success"]["count"], 1);
}
