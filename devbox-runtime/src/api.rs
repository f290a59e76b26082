//! Axum router for the devbox HTTP and WebSocket surface.
//!
//! Provides endpoints for:
//! - Signup and login (PASETO bearer tokens)
//! - Container provisioning, listing, start/stop/delete and one-shot exec
//! - Interactive terminal sessions over WebSocket
//! - Health and metrics

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        FromRequestParts, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use futures_util::{SinkExt, Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::SandboxError;
use crate::identity::{IdentityVerifier, SessionAuthority, extract_bearer_token};
use crate::lifecycle::{LifecycleManager, ProvisionIntent};
use crate::metrics::metrics;
use crate::principals::{Principal, PrincipalStore};
use crate::relay::{RelayConfig, SessionState, run_session};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Request-independent knobs for the API layer.
#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub default_image: String,
    /// Shell used to run string commands on `POST /containers/{id}/exec`.
    pub shell: String,
    pub relay: RelayConfig,
    /// Allowed CORS origins; empty means any.
    pub cors_origins: Vec<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            default_image: crate::config::DEFAULT_IMAGE.to_string(),
            shell: "/bin/sh".to_string(),
            relay: RelayConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub principals: Arc<PrincipalStore>,
    pub authority: Arc<SessionAuthority>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        principals: Arc<PrincipalStore>,
        authority: Arc<SessionAuthority>,
        settings: ApiSettings,
    ) -> Self {
        Self {
            lifecycle,
            principals,
            verifier: authority.clone(),
            authority,
            settings: Arc::new(settings),
        }
    }

    fn principal_for_token(&self, token: &str) -> Result<Principal, SandboxError> {
        let email = self.verifier.verify(token)?;
        self.principals
            .get_by_email(&email)?
            .ok_or_else(|| SandboxError::Unauthenticated("Unknown principal".into()))
    }
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
    code: &'static str,
}

pub fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        SandboxError::Forbidden(_) => StatusCode::FORBIDDEN,
        SandboxError::NotFound(_) | SandboxError::ImageUnavailable(_) => StatusCode::NOT_FOUND,
        SandboxError::NotRunning(_) | SandboxError::Conflict(_) => StatusCode::CONFLICT,
        SandboxError::EngineFailure(_) => StatusCode::BAD_GATEWAY,
        SandboxError::Validation(_) => StatusCode::BAD_REQUEST,
        SandboxError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SandboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        (
            status,
            Json(ApiError {
                error: self.to_string(),
                code: self.code(),
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Bearer auth extractor
// ---------------------------------------------------------------------------

/// Axum extractor resolving `Authorization: Bearer <token>` to a registered
/// principal.
///
/// ```ignore
/// async fn handler(SessionAuth(principal): SessionAuth) -> impl IntoResponse { ... }
/// ```
pub struct SessionAuth(pub Principal);

impl FromRequestParts<AppState> for SessionAuth {
    type Rejection = SandboxError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_from_headers(&parts.headers)
            .ok_or_else(|| SandboxError::Unauthenticated("Missing bearer token".into()))?;
        state.principal_for_token(&token).map(SessionAuth)
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SignupRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Serialize)]
struct SignupResponse {
    id: String,
    username: String,
    email: String,
    access_token: String,
    token_type: String,
}

async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, SandboxError> {
    let principal = state
        .principals
        .register(&req.username, &req.email, &req.password)?;
    let token = state.authority.issue(&principal.email)?;
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            id: principal.id,
            username: principal.username,
            email: principal.email,
            access_token: token.access_token,
            token_type: token.token_type,
        }),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    access_token: String,
    token_type: String,
    user_name: String,
    user_mail: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, SandboxError> {
    let principal = state.principals.authenticate(&req.email, &req.password)?;
    let token = state.authority.issue(&principal.email)?;
    tracing::info!(principal = %principal.id, "login");
    Ok(Json(LoginResponse {
        access_token: token.access_token,
        token_type: token.token_type,
        user_name: principal.username,
        user_mail: principal.email,
    }))
}

// ---------------------------------------------------------------------------
// Container endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct ProvisionRequest {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    start: Option<bool>,
}

async fn provision_container(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
    body: Option<Json<ProvisionRequest>>,
) -> Result<impl IntoResponse, SandboxError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let image = req
        .image
        .filter(|i| !i.trim().is_empty())
        .unwrap_or_else(|| state.settings.default_image.clone());
    let intent = if req.start.unwrap_or(true) {
        ProvisionIntent::CreateAndStart
    } else {
        ProvisionIntent::Create
    };
    let record = state
        .lifecycle
        .provision(&principal.id, &image, intent)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_containers(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
) -> Result<impl IntoResponse, SandboxError> {
    let containers = state.lifecycle.list(&principal.id)?;
    Ok(Json(serde_json::json!({ "containers": containers })))
}

async fn start_container(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SandboxError> {
    Ok(Json(state.lifecycle.start(&principal.id, &id).await?))
}

async fn stop_container(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SandboxError> {
    Ok(Json(state.lifecycle.stop(&principal.id, &id).await?))
}

async fn delete_container(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SandboxError> {
    state.lifecycle.delete(&principal.id, &id).await?;
    Ok(Json(serde_json::json!({ "id": id, "deleted": true })))
}

/// Either an argv array or a single string run through the shell.
#[derive(Deserialize)]
#[serde(untagged)]
enum CommandInput {
    Argv(Vec<String>),
    Line(String),
}

#[derive(Deserialize)]
struct ExecRequest {
    command: CommandInput,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    output: String,
    exit_code: i64,
}

async fn exec_container(
    State(state): State<AppState>,
    SessionAuth(principal): SessionAuth,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, SandboxError> {
    let command = match req.command {
        CommandInput::Argv(argv) => argv,
        CommandInput::Line(line) => vec![state.settings.shell.clone(), "-c".to_string(), line],
    };
    let timeout = req.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
    let out = state
        .lifecycle
        .exec(&principal.id, &id, &command, timeout)
        .await?;
    Ok(Json(ExecResponse {
        output: out.output,
        exit_code: out.exit_code,
    }))
}

// ---------------------------------------------------------------------------
// Terminal session
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct SessionQuery {
    /// Browsers cannot set headers on WebSocket requests.
    #[serde(default)]
    token: Option<String>,
}

async fn container_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, SandboxError> {
    tracing::debug!(container_id = %id, state = %SessionState::Connecting, "session requested");
    let token = bearer_from_headers(&headers)
        .or(query.token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SandboxError::Unauthenticated("Missing bearer token".into()))?;
    let principal = state.principal_for_token(&token)?;

    // Ownership and running checks happen before the upgrade, and the shell
    // is attached only for a valid upgrade request.
    state.lifecycle.require_running(&principal.id, &id).await?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let attachment = state.lifecycle.open_session(&principal.id, &id).await?;

    let relay = state.settings.relay.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket_halves(socket);
        let report = run_session(attachment, sink, stream, relay).await;
        tracing::debug!(container_id = %id, end = ?report.end, "websocket session finished");
    }))
}

fn socket_halves(
    socket: WebSocket,
) -> (
    impl futures_util::Sink<Bytes, Error = axum::Error> + Unpin + Send + 'static,
    impl Stream<Item = Result<Bytes, axum::Error>> + Unpin + Send + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(frame))));
    (sink, client_frames(stream))
}

/// Client messages as raw bytes: text and binary carry payload, control
/// frames are skipped, a close frame ends the stream.
fn client_frames<St, E>(stream: St) -> impl Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static
where
    St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
        })
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_snapshot() -> impl IntoResponse {
    let snapshot: serde_json::Map<String, serde_json::Value> = metrics()
        .snapshot()
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::from(v)))
        .collect();
    Json(serde_json::Value::Object(snapshot))
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let allow_origin = if parsed.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the API router with all endpoints, CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        // Auth
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        // Containers
        .route("/containers", get(list_containers).post(provision_container))
        .route("/containers/{id}", axum::routing::delete(delete_container))
        .route("/containers/{id}/start", put(start_container))
        .route("/containers/{id}/stop", put(stop_container))
        .route("/containers/{id}/exec", post(exec_container))
        .route("/containers/{id}/session", get(container_session))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
