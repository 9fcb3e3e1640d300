//! NpmClient tests against a mock Nginx Proxy Manager
//!
//! The mock is a small axum app bound to an ephemeral port that mimics the
//! token and stream endpoints, including NPM's error body shape.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use npm_meta_lib::{MetaError, NpmClient, RuleSpec, StreamApi};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "eyJ.mock.token";

#[derive(Clone, Default)]
struct MockNpm {
    streams: Arc<Mutex<Vec<Value>>>,
}

fn npm_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": message } })),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false)
}

async fn tokens(Json(body): Json<Value>) -> Response {
    if body["identity"] == "admin@example.com" && body["secret"] == "changeme" {
        Json(json!({ "token": TOKEN, "expires": "2030-01-01T00:00:00.000Z" })).into_response()
    } else {
        npm_error(StatusCode::UNAUTHORIZED, "Invalid email or password")
    }
}

async fn list_streams(State(state): State<MockNpm>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return npm_error(StatusCode::UNAUTHORIZED, "Token has expired");
    }
    Json(Value::Array(state.streams.lock().unwrap().clone())).into_response()
}

async fn create_stream(
    State(state): State<MockNpm>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return npm_error(StatusCode::UNAUTHORIZED, "Token has expired");
    }
    let mut streams = state.streams.lock().unwrap();
    if streams
        .iter()
        .any(|s| s["incoming_port"] == body["incoming_port"])
    {
        return npm_error(
            StatusCode::BAD_REQUEST,
            &format!("Port {} is already in use", body["incoming_port"]),
        );
    }
    let stream = json!({
        "id": streams.len() as i64 + 1,
        "incoming_port": body["incoming_port"],
        "forwarding_host": body["forwarding_host"],
        "forwarding_port": body["forwarding_port"],
        "tcp_forwarding": if body["tcp_forwarding"] == true { 1 } else { 0 },
        "udp_forwarding": if body["udp_forwarding"] == true { 1 } else { 0 },
        "enabled": 1,
        "certificate_id": body["certificate_id"],
        "meta": body["meta"],
    });
    streams.push(stream.clone());
    (StatusCode::CREATED, Json(stream)).into_response()
}

async fn delete_stream(
    State(state): State<MockNpm>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if !authorized(&headers) {
        return npm_error(StatusCode::UNAUTHORIZED, "Token has expired");
    }
    let mut streams = state.streams.lock().unwrap();
    let before = streams.len();
    streams.retain(|s| s["id"] != id);
    if streams.len() == before {
        npm_error(StatusCode::NOT_FOUND, "Not Found")
    } else {
        Json(json!(true)).into_response()
    }
}

/// Start the mock and return (client, state)
async fn start_mock() -> (NpmClient, MockNpm) {
    let state = MockNpm::default();
    let app = Router::new()
        .route("/api/tokens", post(tokens))
        .route("/api/nginx/streams", get(list_streams).post(create_stream))
        .route("/api/nginx/streams/:id", delete(delete_stream))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = NpmClient::new(&format!("http://{}/api", addr), Duration::from_secs(5)).unwrap();
    (client, state)
}

#[tokio::test]
async fn test_login_success() {
    let (client, _state) = start_mock().await;
    let token = client.login("admin@example.com", "changeme").await.unwrap();
    assert_eq!(token.token, TOKEN);
    assert_eq!(token.expires.as_deref(), Some("2030-01-01T00:00:00.000Z"));
}

#[tokio::test]
async fn test_login_bad_credentials() {
    let (client, _state) = start_mock().await;
    let err = client.login("admin@example.com", "nope").await.unwrap_err();
    match err {
        MetaError::AuthenticationFailed(message) => {
            assert_eq!(message, "Invalid email or password")
        }
        other => panic!("expected AuthenticationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_create_list_delete_cycle() {
    let (client, _state) = start_mock().await;

    let created = client
        .create_stream(TOKEN, &RuleSpec::new(8080, "10.0.0.2", 80))
        .await
        .unwrap();
    assert_eq!(created.id, 1);
    assert_eq!(created.incoming_port, 8080);
    assert!(created.tcp_forwarding);
    assert!(!created.udp_forwarding);
    assert!(created.enabled);

    let streams = client.list_streams(TOKEN).await.unwrap();
    assert_eq!(streams, vec![created.clone()]);

    client.delete_stream(TOKEN, created.id).await.unwrap();
    assert!(client.list_streams(TOKEN).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_sends_npm_payload_defaults() {
    let (client, state) = start_mock().await;
    client
        .create_stream(TOKEN, &RuleSpec::new(2222, "nas.lan", 22))
        .await
        .unwrap();

    let stored = state.streams.lock().unwrap()[0].clone();
    assert_eq!(stored["certificate_id"], 0);
    assert_eq!(stored["meta"], json!({}));
}

#[tokio::test]
async fn test_duplicate_port_is_upstream_rejected() {
    let (client, _state) = start_mock().await;
    client
        .create_stream(TOKEN, &RuleSpec::new(8080, "10.0.0.2", 80))
        .await
        .unwrap();

    let err = client
        .create_stream(TOKEN, &RuleSpec::new(8080, "10.0.0.3", 80))
        .await
        .unwrap_err();
    match err {
        MetaError::UpstreamRejected { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Port 8080 is already in use");
        }
        other => panic!("expected UpstreamRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_expired_token_is_authentication_failure() {
    let (client, _state) = start_mock().await;
    let err = client.list_streams("stale-token").await.unwrap_err();
    assert!(matches!(err, MetaError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_delete_unknown_stream_is_not_found() {
    let (client, _state) = start_mock().await;
    let err = client.delete_stream(TOKEN, 404).await.unwrap_err();
    assert!(matches!(err, MetaError::RuleNotFound(404)));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let app = Router::new().route(
        "/api/nginx/streams",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!([]))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client =
        NpmClient::new(&format!("http://{}/api", addr), Duration::from_millis(200)).unwrap();
    let err = client.list_streams(TOKEN).await.unwrap_err();
    assert!(matches!(err, MetaError::UpstreamUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_upstream_is_unavailable() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = NpmClient::new(&format!("http://{}/api", addr), Duration::from_secs(2)).unwrap();
    let err = client.login("admin@example.com", "changeme").await.unwrap_err();
    assert!(matches!(err, MetaError::UpstreamUnavailable(_)));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let app = Router::new().route(
        "/api/nginx/streams",
        get(|| async { (StatusCode::BAD_GATEWAY, "bad gateway") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = NpmClient::new(&format!("http://{}/api", addr), Duration::from_secs(2)).unwrap();
    let err = client.list_streams(TOKEN).await.unwrap_err();
    assert!(matches!(err, MetaError::UpstreamUnavailable(_)));
}
