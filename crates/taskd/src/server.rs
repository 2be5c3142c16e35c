//! HTTP control plane for taskd.
//!
//! Local-only REST API bound to 127.0.0.1, optionally guarded by a bearer
//! token. Invalid lifecycle transitions map to 409, kill-switch refusals
//! to 423, unknown ids to 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use task_core::{
    AuditEvent, Attempt, Checkpoint, Config, Id, KillSwitchMode, Task, TaskKind, TaskState,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::queue::{NewTask, QueueError, TaskQueue};
use crate::storage::{Storage, StorageError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub queue: Arc<TaskQueue>,
    pub coordinator: Arc<Coordinator>,
    pub config: Config,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/audit", get(list_audit))
        .route("/tasks/{id}/attempts", get(list_attempts))
        .route("/tasks/{id}/checkpoints", get(list_checkpoints))
        .route("/tasks/{id}/resolve", post(resolve_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/killswitch", get(get_killswitch).put(put_killswitch))
        .route("/summary", get(summary))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server. Binds to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("control plane listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid auth token",
            )),
            None => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing auth token",
            )),
        }
    } else {
        Ok(())
    }
}

/// Kill switch OFF refuses work-creating operations.
fn check_killswitch(state: &AppState) -> Result<(), ApiError> {
    if state.coordinator.mode() == KillSwitchMode::Off {
        return Err(api_error(
            StatusCode::LOCKED,
            "kill_switch",
            "kill switch is off",
        ));
    }
    Ok(())
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            error: message.into(),
        }),
    )
}

fn queue_error(e: QueueError) -> ApiError {
    match e {
        QueueError::DuplicateTask(id) => api_error(
            StatusCode::CONFLICT,
            "duplicate_task",
            format!("duplicate task id: {id}"),
        ),
        QueueError::InvalidDependency { task, dependency } => api_error(
            StatusCode::BAD_REQUEST,
            "invalid_dependency",
            format!("task {task} depends on unknown task {dependency}"),
        ),
        QueueError::InvalidTransition { from, to } => api_error(
            StatusCode::CONFLICT,
            "invalid_transition",
            format!("invalid state transition: {from} -> {to}"),
        ),
        QueueError::Storage(e) => storage_error(e),
    }
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::TaskNotFound(id) => api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("task not found: {id}"),
        ),
        other => {
            error!("storage error: {}", other);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                other.to_string(),
            )
        }
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

/// Request payload for POST /tasks.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub kind: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListAuditResponse {
    pub events: Vec<AuditEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListAttemptsResponse {
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListCheckpointsResponse {
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResolveTaskRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillSwitchResponse {
    pub mode: KillSwitchMode,
}

#[derive(Debug, Deserialize)]
pub struct SetKillSwitchRequest {
    pub mode: KillSwitchMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub counts: Vec<StateCount>,
    pub active_loops: usize,
    pub mode: KillSwitchMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateCount {
    pub state: TaskState,
    pub count: u64,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /tasks - Enqueue a task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    check_killswitch(&state)?;

    let Some(kind) = TaskKind::parse(&req.kind) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_kind",
            format!("unknown task kind: {}", req.kind),
        ));
    };

    let max_attempts = req
        .max_attempts
        .unwrap_or_else(|| state.config.max_attempts_for(kind));

    let task = state
        .queue
        .enqueue(NewTask {
            id: req.id.map(Id::from_string),
            title: req.title,
            kind,
            priority: req.priority.unwrap_or(100),
            dependencies: req.dependencies.into_iter().map(Id::from_string).collect(),
            max_attempts,
        })
        .await
        .map_err(queue_error)?;

    info!(task_id = %task.id, "task created via control plane");
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /tasks - List tasks, optionally filtered by state.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let filter = match query.state.as_deref() {
        Some(s) => match TaskState::parse(&s.to_ascii_uppercase()) {
            Some(state) => Some(state),
            None => {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_state",
                    format!("unknown task state: {s}"),
                ));
            }
        },
        None => None,
    };

    let tasks = state
        .storage
        .list_tasks(filter)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListTasksResponse { tasks }))
}

/// GET /tasks/{id} - Get a single task.
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task = state
        .storage
        .get_task(&Id::from_string(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(TaskResponse { task }))
}

/// GET /tasks/{id}/audit - Audit trail for a task.
async fn list_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    state
        .storage
        .get_task(&task_id)
        .await
        .map_err(storage_error)?;

    let events = state
        .storage
        .list_events(&task_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListAuditResponse { events }))
}

/// GET /tasks/{id}/attempts - Attempt history for a task.
async fn list_attempts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    state
        .storage
        .get_task(&task_id)
        .await
        .map_err(storage_error)?;

    let attempts = state
        .storage
        .list_attempts(&task_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListAttemptsResponse { attempts }))
}

/// GET /tasks/{id}/checkpoints - Checkpoint history for a task.
async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    state
        .storage
        .get_task(&task_id)
        .await
        .map_err(storage_error)?;

    let checkpoints = state
        .storage
        .list_checkpoints(&task_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListCheckpointsResponse { checkpoints }))
}

/// POST /tasks/{id}/resolve - Force a BLOCKED task back to PENDING.
async fn resolve_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ResolveTaskRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    check_killswitch(&state)?;

    let note = body.and_then(|Json(req)| req.note);
    let task = state
        .queue
        .resolve(&Id::from_string(id), "operator", note)
        .await
        .map_err(queue_error)?;
    Ok(Json(TaskResponse { task }))
}

/// POST /tasks/{id}/cancel - Cancel a non-terminal task.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task = state
        .queue
        .cancel(&Id::from_string(id), "operator")
        .await
        .map_err(queue_error)?;
    Ok(Json(TaskResponse { task }))
}

/// GET /killswitch - Current mode.
async fn get_killswitch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    Ok(Json(KillSwitchResponse {
        mode: state.coordinator.mode(),
    }))
}

/// PUT /killswitch - Set the mode (operator only).
async fn put_killswitch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SetKillSwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let previous = state
        .coordinator
        .set_mode(req.mode, "operator")
        .await
        .map_err(|e| {
            error!("failed to set kill switch: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                e.to_string(),
            )
        })?;

    warn!(
        previous = previous.as_str(),
        current = req.mode.as_str(),
        "kill switch set via control plane"
    );
    Ok(Json(KillSwitchResponse { mode: req.mode }))
}

/// GET /summary - State counts plus scheduler status.
async fn summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let counts = state
        .storage
        .counts_by_state()
        .await
        .map_err(storage_error)?
        .into_iter()
        .map(|(state, count)| StateCount { state, count })
        .collect();

    Ok(Json(SummaryResponse {
        counts,
        active_loops: state.coordinator.active_loops(),
        mode: state.coordinator.mode(),
    }))
}
