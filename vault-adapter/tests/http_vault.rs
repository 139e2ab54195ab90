//! `HttpVaultClient` against a loopback axum stub of the vault API.

use axum::extract::{Json, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use vault_adapter::config::SecretValue;
use vault_adapter::{ArchiveEntry, ArchiveKind, HttpVaultClient, VaultClient, VaultError};

const API_KEY: &str = "stub-key";

#[derive(Default)]
struct StubState {
    archives: Mutex<HashMap<String, Value>>,
    retention: Mutex<HashMap<String, String>>,
}

type Shared = Arc<StubState>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == format!("Bearer {}", API_KEY))
}

async fn archive(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(entry): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
    }
    if entry["session_id"] == "reject-me" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "rejected"})));
    }
    if entry["session_id"] == "overloaded" {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})));
    }
    let mut archives = state.archives.lock().unwrap();
    let id = format!("arch-{}", archives.len() + 1);
    archives.insert(id.clone(), entry);
    (StatusCode::OK, Json(json!({ "archive_id": id })))
}

async fn batch(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    let mut archives = state.archives.lock().unwrap();
    let mut ids = Vec::new();
    for entry in body["entries"].as_array().cloned().unwrap_or_default() {
        let id = format!("arch-{}", archives.len() + 1);
        archives.insert(id.clone(), entry);
        ids.push(id);
    }
    (StatusCode::OK, Json(json!({ "archive_ids": ids })))
}

async fn fetch(State(state): State<Shared>, Path(id): Path<String>) -> impl IntoResponse {
    match state.archives.lock().unwrap().get(&id) {
        Some(entry) => (StatusCode::OK, Json(entry.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "no such archive"}))),
    }
}

async fn remove(State(state): State<Shared>, Path(id): Path<String>) -> StatusCode {
    match state.archives.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn retention(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let policy = body["policy_id"].as_str().unwrap_or_default().to_string();
    state.retention.lock().unwrap().insert(id, policy);
    StatusCode::NO_CONTENT
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn spawn_stub() -> (String, Shared) {
    let state: Shared = Arc::new(StubState::default());
    let router = Router::new()
        .route("/api/v1/archives", post(archive))
        .route("/api/v1/archives/batch", post(batch))
        .route("/api/v1/archives/:id", get(fetch).delete(remove))
        .route("/api/v1/archives/:id/retention", post(retention))
        .route("/health", get(health))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/", addr), state)
}

fn entry(session_id: &str) -> ArchiveEntry {
    ArchiveEntry {
        session_id: session_id.to_string(),
        kind: ArchiveKind::Session,
        payload: json!({"nodes": [{"content": "[EMAIL_REDACTED]"}]}),
        retention_days: 30,
        tags: BTreeSet::from(["support".to_string()]),
        metadata: HashMap::new(),
        captured_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_archive_retrieve_delete_round_trip() {
    let (endpoint, state) = spawn_stub().await;
    let client = HttpVaultClient::new(&endpoint, SecretValue::new(API_KEY), 5).unwrap();

    let id = client.archive(&entry("s1")).await.unwrap();
    assert_eq!(id, "arch-1");
    let fetched = client.retrieve(&id).await.unwrap();
    assert_eq!(fetched, {
        let mut expected = entry("s1");
        expected.captured_at = fetched.captured_at;
        expected
    });

    client.apply_retention_policy(&id, "legal-hold").await.unwrap();
    assert_eq!(
        state.retention.lock().unwrap().get(&id).map(String::as_str),
        Some("legal-hold")
    );

    client.delete(&id).await.unwrap();
    assert_eq!(
        client.retrieve(&id).await.unwrap_err(),
        VaultError::NotFound(id.clone())
    );
}

#[tokio::test]
async fn test_batch_archive_returns_ids_in_order() {
    let (endpoint, state) = spawn_stub().await;
    let client = HttpVaultClient::new(&endpoint, SecretValue::new(API_KEY), 5).unwrap();
    let ids = client
        .batch_archive(&[entry("a"), entry("b")])
        .await
        .unwrap();
    assert_eq!(ids, vec!["arch-1".to_string(), "arch-2".to_string()]);
    let archives = state.archives.lock().unwrap();
    assert_eq!(archives["arch-2"]["session_id"], "b");
}

#[tokio::test]
async fn test_error_statuses_map_to_vault_errors() {
    let (endpoint, _state) = spawn_stub().await;
    let client = HttpVaultClient::new(&endpoint, SecretValue::new(API_KEY), 5).unwrap();

    let err = client.archive(&entry("reject-me")).await.unwrap_err();
    assert!(matches!(err, VaultError::ApiError { status: 400, .. }));
    assert!(!err.is_retryable());

    let err = client.archive(&entry("overloaded")).await.unwrap_err();
    assert!(matches!(err, VaultError::ApiError { status: 503, .. }));
    assert!(err.is_retryable());

    let wrong_key = HttpVaultClient::new(&endpoint, SecretValue::new("nope"), 5).unwrap();
    let err = wrong_key.archive(&entry("s1")).await.unwrap_err();
    assert!(matches!(err, VaultError::AuthenticationError(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_health_check_reads_status() {
    let (endpoint, _state) = spawn_stub().await;
    let client = HttpVaultClient::new(&endpoint, SecretValue::new(API_KEY), 5).unwrap();
    assert!(client.health_check().await.unwrap());
}
