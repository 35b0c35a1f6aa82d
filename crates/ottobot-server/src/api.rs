//! Frontend gateway: HTTP surface over the registry, queue and fabric.
//!
//! Thin by design. Session state transitions happen on workers; the
//! handlers here validate input, touch the registry, enqueue jobs and
//! shape responses. The one stateful concern, the per-session chat
//! socket, lives in `chat.rs`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::{OpenApi as UtoipaOpenApi, ToSchema};

use ottobot_sandbox::Supervisor;
use ottobot_session::{
    Environment, JobKind, MessageFabric, PortAllocator, Session, SessionError, SessionLogEntry,
    SessionPatch, SessionRegistry, SessionStatus, WorkQueue, WorkerEntry, WorkerStatus,
};
use ottobot_store::Store;

use crate::chat;
use crate::config::Config;

const MAX_PROMPT_CHARS: usize = 5000;
const MIN_TIMEOUT_SECS: u64 = 300;
const MAX_TIMEOUT_SECS: u64 = 7200;
const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;
const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("upstream request failed: {0}")]
    BadGateway(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotFound(id) => ApiError::NotFound(id),
            SessionError::PortsExhausted(kind) => {
                ApiError::Unavailable(format!("No available {kind} ports. Try again later."))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "Bad Gateway"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };
        let body = ErrorBody {
            error: reason.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: SessionRegistry,
    pub fabric: MessageFabric,
    pub queue: WorkQueue,
    pub desktop_ports: PortAllocator,
    pub tool_ports: PortAllocator,
    pub supervisor: Arc<dyn Supervisor>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

#[allow(dead_code)]
fn assert_app_state_bounds() {
    fn assert_state<T: Clone + Send + Sync + 'static>() {}
    assert_state::<AppState>();
}

// ---------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// First user utterance handed to the agent (1..5000 chars).
    pub initial_prompt: String,
    /// Session TTL in seconds, 300..7200.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub environment: Option<Environment>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_url: Option<String>,
    pub chat_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
}

impl SessionResponse {
    pub fn from_session(session: &Session, config: &Config) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            desktop_url: session.desktop_port.map(|p| config.desktop_url(p)),
            chat_url: config.chat_url(&session.id),
            created_at: session.created_at,
            expires_at: session.expires_at,
            initial_prompt: Some(session.initial_prompt.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionResponse>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TerminateResponse {
    pub message: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LogsResponse {
    pub session_id: String,
    pub logs: Vec<SessionLogEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthServices {
    pub store: bool,
    pub sandbox_runtime: bool,
    pub workers: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_s: u64,
    pub services: HealthServices,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerStatusEntry {
    pub id: String,
    pub active: bool,
    pub current_jobs: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MetricsResponse {
    pub active_sessions: usize,
    pub total_sessions: i64,
    pub queue_length: usize,
    pub worker_status: Vec<WorkerStatusEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        create_session,
        list_sessions,
        get_session,
        terminate_session,
        get_session_logs,
        download_workspace,
        health,
        health_metrics,
    ),
    components(schemas(
        CreateSessionRequest,
        SessionResponse,
        ListSessionsResponse,
        TerminateResponse,
        LogsResponse,
        HealthResponse,
        HealthServices,
        MetricsResponse,
        WorkerStatusEntry,
        ErrorBody,
        Environment,
        SessionStatus,
        SessionLogEntry,
    )),
    tags((name = "sessions", description = "Manage sandboxed coding sessions"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        utoipa_swagger_ui::SwaggerUi::new("/docs")
            .url("/openapi.json", openapi)
            .into();

    let cors = cors_layer(&state.config);

    Router::new()
        .route("/session", get(list_sessions).post(create_session))
        .route(
            "/session/{id}",
            get(get_session).delete(terminate_session),
        )
        .route("/session/{id}/logs", get(get_session_logs))
        .route("/session/{id}/chat", get(chat::chat_socket))
        .route("/download/{id}", get(download_workspace))
        .route("/health", get(health))
        .route("/health/metrics", get(health_metrics))
        .merge(swagger_routes)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);
    if config.cors_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

// ---------------------------------------------------------------------
// Session CRUD
// ---------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/session",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 503, description = "No desktop port available", body = ErrorBody)
    )
)]
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let prompt_chars = request.initial_prompt.chars().count();
    if prompt_chars == 0 || prompt_chars > MAX_PROMPT_CHARS {
        return Err(ApiError::Validation(format!(
            "initial_prompt must be 1..{MAX_PROMPT_CHARS} characters"
        )));
    }
    let timeout = match request.timeout {
        Some(secs) if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) => {
            return Err(ApiError::Validation(format!(
                "timeout must be within [{MIN_TIMEOUT_SECS}, {MAX_TIMEOUT_SECS}] seconds"
            )));
        }
        Some(secs) => Some(std::time::Duration::from_secs(secs)),
        None => None,
    };
    let environment = request.environment.unwrap_or_default();

    let session = state
        .registry
        .create(&request.initial_prompt, timeout, environment)
        .await?;

    let desktop_port = match state.desktop_ports.allocate(&session.id).await? {
        Some(port) => port,
        None => {
            // Roll the record back so a doomed session does not linger in
            // listings until its TTL.
            if let Err(error) = state.registry.delete(&session.id).await {
                tracing::warn!(session_id = %session.id, %error, "rollback after port exhaustion failed");
            }
            return Err(ApiError::Unavailable(
                "No available desktop ports. Try again later.".to_string(),
            ));
        }
    };
    let session = state
        .registry
        .update(&session.id, SessionPatch {
            desktop_port: Some(desktop_port),
            ..Default::default()
        })
        .await?
        .ok_or_else(|| ApiError::Internal("session vanished during create".to_string()))?;

    state
        .queue
        .enqueue(
            JobKind::CreateSession,
            &session.id,
            serde_json::json!({"environment": environment}),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_session(&session, &state.config)),
    ))
}

#[utoipa::path(
    get,
    path = "/session",
    params(
        ("limit" = Option<usize>, Query, description = "Page size, capped at 100"),
        ("offset" = Option<usize>, Query, description = "Items to skip")
    ),
    responses((status = 200, description = "Active sessions, newest first", body = ListSessionsResponse))
)]
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListSessionsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let sessions = state.registry.list_active(limit, offset).await?;
    let total = state.registry.count_active().await?;
    Ok(Json(ListSessionsResponse {
        sessions: sessions
            .iter()
            .map(|s| SessionResponse::from_session(s, &state.config))
            .collect(),
        total,
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/session/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session detail", body = SessionResponse),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(id))?;
    Ok(Json(SessionResponse::from_session(&session, &state.config)))
}

#[utoipa::path(
    delete,
    path = "/session/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 202, description = "Termination initiated", body = TerminateResponse),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TerminateResponse>)> {
    let session = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    if !session.status.is_terminal() {
        state
            .registry
            .set_status(&id, SessionStatus::Terminating, None)
            .await?;
        state
            .queue
            .enqueue(JobKind::TerminateSession, &id, serde_json::json!({}))
            .await?;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(TerminateResponse {
            message: "Session termination initiated".to_string(),
            session_id: id,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/session/{id}/logs",
    params(
        ("id" = String, Path, description = "Session identifier"),
        ("limit" = Option<usize>, Query, description = "Trailing entries to return")
    ),
    responses(
        (status = 200, description = "Session log tail", body = LogsResponse),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
async fn get_session_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    if state.registry.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(id));
    }
    let logs = state
        .registry
        .read_logs(&id, Some(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)))
        .await?;
    Ok(Json(LogsResponse {
        session_id: id,
        logs,
    }))
}

// ---------------------------------------------------------------------
// Workspace download (streamed proxy to the sandbox's tool endpoint)
// ---------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/download/{id}",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Workspace archive stream"),
        (status = 400, description = "Session has no tool endpoint", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody),
        (status = 502, description = "Sandbox did not answer", body = ErrorBody)
    )
)]
async fn download_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let session = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;
    let tool_port = session.tool_port.ok_or_else(|| {
        ApiError::Validation("session has no tool endpoint yet".to_string())
    })?;

    let url = state.config.download_url(tool_port);
    let upstream = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    // The archive's identity headers travel through untouched.
    for name in [CONTENT_TYPE, CONTENT_DISPOSITION, CONTENT_LENGTH] {
        if let Some(value) = upstream.headers().get(name.as_str()) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                response = response.header(name, value);
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_ok = state.store.get("health:probe").await.is_ok();
    let runtime_ok = state.supervisor.available().await;
    let workers = match active_workers(&state).await {
        Ok(entries) => entries.len(),
        Err(_) => 0,
    };

    let status = if !store_ok {
        "unhealthy"
    } else if !runtime_ok || workers == 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_s: state.started_at.elapsed().as_secs(),
        services: HealthServices {
            store: store_ok,
            sandbox_runtime: runtime_ok,
            workers,
        },
        timestamp: Utc::now(),
    })
}

#[utoipa::path(
    get,
    path = "/health/metrics",
    responses((status = 200, description = "Plane metrics", body = MetricsResponse))
)]
async fn health_metrics(State(state): State<AppState>) -> ApiResult<Json<MetricsResponse>> {
    let active_sessions = state.registry.count_active().await?;
    let total_sessions = state.registry.total_sessions().await?;
    let queue_length = state.queue.pending_len().await?;

    let mut worker_status = Vec::new();
    for entry in active_workers(&state).await? {
        let current_jobs = state.queue.jobs_for_worker(&entry.id).await?.len();
        worker_status.push(WorkerStatusEntry {
            id: entry.id.clone(),
            active: entry.status == WorkerStatus::Active,
            current_jobs,
        });
    }

    Ok(Json(MetricsResponse {
        active_sessions,
        total_sessions,
        queue_length,
        worker_status,
        timestamp: Utc::now(),
    }))
}

async fn active_workers(state: &AppState) -> ApiResult<Vec<WorkerEntry>> {
    let mut entries = Vec::new();
    for key in state.store.keys("worker:*:status").await.map_err(SessionError::from)? {
        if let Some(raw) = state.store.get(&key).await.map_err(SessionError::from)? {
            match serde_json::from_str::<WorkerEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    tracing::warn!(key, %error, "unparseable worker entry");
                }
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_mapping() {
        let exhausted: ApiError = SessionError::PortsExhausted("desktop").into();
        assert!(matches!(exhausted, ApiError::Unavailable(_)));
        let missing: ApiError = SessionError::NotFound("abc".into()).into();
        assert!(matches!(missing, ApiError::NotFound(_)));
    }

    #[test]
    fn session_response_urls() {
        let config = Config {
            public_host: "h".to_string(),
            api_port: 9000,
            ..Default::default()
        };
        let now = Utc::now();
        let session = Session {
            id: "abc".to_string(),
            status: SessionStatus::Ready,
            initial_prompt: "p".to_string(),
            environment: Environment::Node,
            created_at: now,
            updated_at: now,
            expires_at: now,
            desktop_port: Some(6080),
            tool_port: Some(8080),
            sandbox_id: None,
            worker_id: None,
            error: None,
        };
        let response = SessionResponse::from_session(&session, &config);
        assert_eq!(
            response.desktop_url.as_deref(),
            Some("http://h:6080/vnc.html")
        );
        assert_eq!(response.chat_url, "ws://h:9000/session/abc/chat");

        let pending = Session {
            desktop_port: None,
            ..session
        };
        assert!(SessionResponse::from_session(&pending, &config)
            .desktop_url
            .is_none());
    }
}
