//! End-to-end tests for the request executor over real HTTP.
//!
//! Each test starts a local axum server on an ephemeral port and talks to it
//! through the reqwest transport.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::auth::{AuthEvent, MemoryCredentialStore};
use tally_core::network::{ReqwestTransport, RetryConfig};
use tally_core::{AuthSession, RequestErrorKind, RequestExecutor};

type Hits = Arc<AtomicU32>;

/// Start the server and return its base URL.
async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn test_router(hits: Hits) -> Router {
    Router::new()
        .route("/api/budgets", get(budgets))
        .route("/api/flaky", get(always_unavailable))
        .route("/api/private", get(unauthorized))
        .route("/api/health", get(|| async { "ok" }))
        .route("/api/slow", get(slow))
        .route("/api/goals", post(create_goal))
        .with_state(hits)
}

async fn budgets(State(hits): State<Hits>, headers: HeaderMap) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    Json(json!({
        "budgets": [{ "category": "groceries", "limit": 400 }],
        "authorization": header("authorization"),
        "dev_user": header("x-sm-user-id"),
        "accept": header("accept"),
    }))
}

async fn always_unavailable(State(hits): State<Hits>) -> (StatusCode, Json<Value>) {
    hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "maintenance" })),
    )
}

async fn unauthorized(State(hits): State<Hits>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED
}

async fn slow(State(hits): State<Hits>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "late": true }))
}

async fn create_goal(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "Goal name is required" })),
        );
    }
    (StatusCode::CREATED, Json(json!({ "id": 11, "name": body["name"] })))
}

async fn executor_for(session: Arc<AuthSession>) -> (RequestExecutor, Hits) {
    let hits = Hits::default();
    let base_url = spawn_server(test_router(hits.clone())).await;
    let executor = RequestExecutor::new(
        &base_url,
        Arc::new(ReqwestTransport::new().unwrap()),
        session,
    )
    .unwrap()
    .with_timeout(Duration::from_millis(300))
    .with_retry(
        RetryConfig::new()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50)),
    );
    (executor, hits)
}

#[tokio::test]
async fn test_get_sends_json_and_bearer_headers() {
    let session = Arc::new(AuthSession::new(Arc::new(MemoryCredentialStore::with_token(
        "secret",
    ))));
    let (executor, hits) = executor_for(session).await;

    let payload = executor
        .execute(
            reqwest::Method::GET,
            "/api/budgets",
            None,
            &[("x-sm-user-id".to_string(), "dev-9".to_string())],
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(payload["budgets"][0]["limit"], 400);
    assert_eq!(payload["authorization"], "Bearer secret");
    assert_eq!(payload["dev_user"], Value::Null);
    assert_eq!(payload["accept"], "application/json");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dev_identity_without_token() {
    let session = Arc::new(AuthSession::in_memory().with_dev_user_id(Some("dev-3".to_string())));
    let (executor, _) = executor_for(session).await;

    let payload = executor.get("/api/budgets").await.unwrap().unwrap();

    assert_eq!(payload["dev_user"], "dev-3");
    assert_eq!(payload["authorization"], Value::Null);
}

#[tokio::test]
async fn test_service_unavailable_exhausts_retries() {
    let (executor, hits) = executor_for(Arc::new(AuthSession::in_memory())).await;

    let err = executor.get("/api/flaky").await.unwrap_err();

    assert_eq!(err.kind, RequestErrorKind::Server);
    assert_eq!(err.status, Some(503));
    assert_eq!(err.message, "maintenance");
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unauthorized_invalidates_once() {
    let session = Arc::new(AuthSession::new(Arc::new(MemoryCredentialStore::with_token(
        "stale",
    ))));
    let mut events = session.subscribe();
    let (executor, hits) = executor_for(session.clone()).await;

    let err = executor.get("/api/private").await.unwrap_err();

    assert_eq!(err.kind, RequestErrorKind::Unauthorized);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(session.token(), None);
    assert_eq!(events.recv().await.unwrap(), AuthEvent::Invalidated);
}

#[tokio::test]
async fn test_plain_text_success_has_no_payload() {
    let (executor, _) = executor_for(Arc::new(AuthSession::in_memory())).await;

    assert_eq!(executor.get("/api/health").await.unwrap(), None);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let (executor, hits) = executor_for(Arc::new(AuthSession::in_memory())).await;
    let executor = executor.with_retry(RetryConfig::none());

    let err = executor.get("/api/slow").await.unwrap_err();

    assert_eq!(err.kind, RequestErrorKind::Timeout);
    assert_eq!(err.message, "timeout");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_validation_error_is_not_retried() {
    let (executor, _) = executor_for(Arc::new(AuthSession::in_memory())).await;

    let created = executor
        .post("/api/goals", &json!({ "name": "Emergency fund" }))
        .await
        .unwrap();
    assert_eq!(created, Some(json!({ "id": 11, "name": "Emergency fund" })));

    let err = executor
        .post("/api/goals", &json!({ "name": "" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RequestErrorKind::Client);
    assert_eq!(err.status, Some(422));
    assert_eq!(err.message, "Goal name is required");
    assert!(!err.request_id.is_empty());
}
