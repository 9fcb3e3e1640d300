//! Management API for npm-meta
//!
//! Provides HTTP endpoints for:
//! - Server status
//! - Login / logout against NPM
//! - The merged stream view
//! - Creating, annotating and deleting streams
//! - Port suggestion and orphan reaping

use crate::sessions::SessionRegistry;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use npm_meta_lib::{
    Config, CredentialRelay, MergedEntry, MetaError, Metadata, MetadataStore, Reconciler, RuleId,
    RuleSpec, Session, StreamApi,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lifetime of a session created without "remember me"
const SHORT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// API server state
#[derive(Clone)]
pub struct ApiState {
    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
    /// Upstream API base, reported by /status
    pub npm_url: String,
    /// Lifetime of a "remember me" session
    pub session_ttl: Duration,
    pub reconciler: Arc<Reconciler>,
    pub relay: Arc<CredentialRelay>,
    pub sessions: Arc<SessionRegistry>,
}

impl ApiState {
    pub fn new(config: &Config, api: Arc<dyn StreamApi>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            npm_url: config.npm_url.clone(),
            session_ttl: config.session_ttl,
            reconciler: Arc::new(Reconciler::new(Arc::clone(&api), store, config)),
            relay: Arc::new(CredentialRelay::new(api)),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub retryable: bool,
}

impl From<&MetaError> for ErrorBody {
    fn from(err: &MetaError) -> Self {
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// An error response: status code plus `ErrorBody`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                error: message.to_string(),
                code: "unauthorized".to_string(),
                retryable: false,
            },
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message,
                code: "invalid_input".to_string(),
                retryable: false,
            },
        }
    }
}

impl From<MetaError> for ApiError {
    fn from(err: MetaError) -> Self {
        let status = match &err {
            MetaError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            MetaError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MetaError::UpstreamRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MetaError::PortRangeExhausted { .. } => StatusCode::CONFLICT,
            MetaError::RuleNotFound(_) => StatusCode::NOT_FOUND,
            MetaError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = ErrorBody::from(&err);
        if matches!(
            err,
            MetaError::Config(_) | MetaError::Json(_) | MetaError::Io(_) | MetaError::Other(_)
        ) {
            tracing::error!(error = %err, "Internal error");
            body.error = "Internal server error".to_string();
        }

        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Status response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub npm_url: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Local session id, sent back as `Authorization: Bearer <token>`
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub streams: Vec<MergedEntry>,
    pub orphaned: Vec<RuleId>,
}

/// Rule fields and initial metadata in one flat object
#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    #[serde(flatten)]
    pub spec: RuleSpec,
    #[serde(flatten)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub stream: MergedEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct StreamResponse {
    pub stream: MergedEntry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub id: RuleId,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortResponse {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReapResponse {
    pub removed: Vec<RuleId>,
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/streams", get(list_streams).post(create_stream))
        .route("/api/streams/:id", delete(delete_stream))
        .route("/api/streams/:id/meta", put(update_meta))
        .route("/api/ports/next", get(next_port))
        .route("/api/maintenance/reap", post(reap))
        .with_state(state)
}

/// Resolve the bearer session id on a request
async fn require_session(state: &ApiState, headers: &HeaderMap) -> ApiResult<(String, Session)> {
    let id = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing session token"))?;

    let session = state
        .sessions
        .get(id)
        .await
        .ok_or_else(|| ApiError::unauthorized("Session expired or unknown"))?;
    Ok((id.to_string(), session))
}

fn parse_body<T>(body: &[u8]) -> ApiResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)))
}

/// GET /status - Server status (no auth required)
async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        npm_url: state.npm_url.clone(),
    })
}

/// POST /api/login - Exchange NPM credentials for a local session
async fn login(State(state): State<ApiState>, body: Bytes) -> ApiResult<Json<LoginResponse>> {
    let req: LoginRequest = parse_body(&body)?;
    let session = state.relay.login(&req.username, &req.password).await?;

    let ttl = if req.remember_me {
        state.session_ttl
    } else {
        SHORT_SESSION_TTL.min(state.session_ttl)
    };
    let (token, expires_at) = state.sessions.issue(session, ttl).await;

    Ok(Json(LoginResponse { token, expires_at }))
}

/// POST /api/logout
async fn logout(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<SuccessResponse>> {
    let (id, _) = require_session(&state, &headers).await?;
    if let Some(session) = state.sessions.revoke(&id).await {
        state.relay.logout(session);
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /api/streams - Merged view plus orphaned record ids
async fn list_streams(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<StreamsResponse>> {
    let (_, session) = require_session(&state, &headers).await?;
    let result = state.reconciler.list_view(&session).await?;

    Ok(Json(StreamsResponse {
        streams: result.view,
        orphaned: result.orphaned,
    }))
}

/// POST /api/streams - Create a stream with its metadata
async fn create_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<CreateStreamResponse>)> {
    let (_, session) = require_session(&state, &headers).await?;
    let req: CreateStreamRequest = parse_body(&body)?;

    let outcome = state
        .reconciler
        .create_annotated_rule(&session, &req.spec, req.metadata)
        .await?;
    let warning = outcome.warning().map(ErrorBody::from);

    Ok((
        StatusCode::CREATED,
        Json(CreateStreamResponse {
            stream: outcome.into_entry(),
            warning,
        }),
    ))
}

/// PUT /api/streams/:id/meta - Replace a stream's metadata
async fn update_meta(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RuleId>,
    body: Bytes,
) -> ApiResult<Json<StreamResponse>> {
    let (_, session) = require_session(&state, &headers).await?;
    let metadata: Metadata = parse_body(&body)?;

    let stream = state.reconciler.annotate(&session, id, metadata).await?;
    Ok(Json(StreamResponse { stream }))
}

/// DELETE /api/streams/:id
async fn delete_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<RuleId>,
) -> ApiResult<Json<DeleteResponse>> {
    let (_, session) = require_session(&state, &headers).await?;
    state.reconciler.delete_rule(&session, id).await?;
    Ok(Json(DeleteResponse { id, deleted: true }))
}

/// GET /api/ports/next - Suggested incoming port (advisory)
async fn next_port(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<PortResponse>> {
    let (_, session) = require_session(&state, &headers).await?;
    let port = state.reconciler.suggest_port(&session).await?;
    Ok(Json(PortResponse { port }))
}

/// POST /api/maintenance/reap - Run an orphan sweep now
async fn reap(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Json<ReapResponse>> {
    let (_, session) = require_session(&state, &headers).await?;
    let removed = state.reconciler.reap_orphans(&session).await?;
    Ok(Json(ReapResponse { removed }))
}
