//! HTTP control surface and the WebSocket event stream.
//!
//! The router is a thin mapping from the inbound verb set onto the
//! registry, queue, hub, and diagnostics view; all orchestration
//! semantics live below this layer.

use crate::auth::{auth_middleware, create_auth_state};
use crate::config::ApiConfig;
use crate::diagnostics::DiagnosticsView;
use crate::hub::ClientSessionHub;
use crate::models::{AgentRecord, AgentState, ConnectorType, Priority, Task, TaskState};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::{ForemanError, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use validator::Validate;

mod ws;

#[cfg(test)]
mod tests;

const ROUTE_HEALTH: &str = "/health";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_HEARTBEAT: &str = "/agents/{agent_id}/heartbeat";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_STATE: &str = "/state";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_WS: &str = "/ws";

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<ClientSessionHub>,
    pub diagnostics: Arc<DiagnosticsView>,
}

pub struct ApiServer {
    config: ApiConfig,
    state: ApiState,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterAgentRequest {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    pub repository_path: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub ok: bool,
    pub agent: AgentView,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: AgentState,
    pub current_task: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueTaskRequest {
    #[validate(length(min = 1, max = 5000))]
    pub command: String,
    #[serde(default)]
    pub repository_path: String,
    pub priority: Option<Priority>,
    pub origin_subscriber_id: Option<uuid::Uuid>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub repository_path: String,
    pub status: AgentState,
    pub last_heartbeat: String,
    pub current_task_id: Option<String>,
}

impl From<AgentRecord> for AgentView {
    fn from(agent: AgentRecord) -> Self {
        Self {
            id: agent.id,
            name: agent.name,
            connector_type: agent.connector,
            repository_path: agent.repository_path,
            status: agent.status,
            last_heartbeat: agent.last_heartbeat.to_rfc3339(),
            current_task_id: agent.current_task_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: String,
    pub command: String,
    pub repository_path: String,
    pub priority: Priority,
    pub status: TaskState,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            command: task.command,
            repository_path: task.repository_path,
            priority: task.priority,
            status: task.status,
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            assigned_agent_id: task.assigned_agent_id,
            result: task.result,
            error_message: task.error_message,
            retry_count: task.retry_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub accepting: bool,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub agents: Vec<AgentView>,
    pub queue: QueueSummary,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map the error taxonomy onto HTTP statuses.
fn error_response(err: ForemanError) -> Response {
    let status = match &err {
        ForemanError::InvalidInput(_) | ForemanError::Serialization(_) => StatusCode::BAD_REQUEST,
        ForemanError::InvalidTransition(_) => StatusCode::CONFLICT,
        ForemanError::NotFound(_) => StatusCode::NOT_FOUND,
        ForemanError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        ForemanError::Busy(_) => StatusCode::CONFLICT,
        ForemanError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ForemanError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ForemanError::Internal(e.into()))?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| ForemanError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_AGENTS, post(register_agent).get(list_agents))
            .route(ROUTE_AGENT_HEARTBEAT, post(heartbeat_agent))
            .route(ROUTE_TASKS, post(enqueue_task))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_STATE, get(get_state))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .route(ROUTE_WS, get(ws::ws_handler))
            .layer(middleware::from_fn_with_state(
                auth_state.clone(),
                auth_middleware,
            ))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn register_agent(
    State(state): State<ApiState>,
    Json(request): Json<RegisterAgentRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(ForemanError::InvalidInput(e.to_string()));
    }
    let connector = match ConnectorType::from_str(&request.connector_type) {
        Ok(connector) => connector,
        Err(e) => return error_response(ForemanError::InvalidInput(e)),
    };
    match state
        .registry
        .register(&request.id, &request.name, connector, &request.repository_path)
        .await
    {
        Ok(agent) => (
            StatusCode::CREATED,
            Json(RegisterAgentResponse {
                ok: true,
                agent: agent.into(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_agents(State(state): State<ApiState>) -> Response {
    let agents: Vec<AgentView> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(AgentView::from)
        .collect();
    Json(agents).into_response()
}

async fn heartbeat_agent(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    match state
        .registry
        .heartbeat(&agent_id, request.status, request.current_task)
        .await
    {
        Ok(_) => Json(HeartbeatResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn enqueue_task(
    State(state): State<ApiState>,
    Json(request): Json<EnqueueTaskRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(ForemanError::InvalidInput(e.to_string()));
    }
    let mut task = Task::new(
        request.command,
        request.repository_path,
        request.priority.unwrap_or_default(),
    );
    task.origin_subscriber_id = request.origin_subscriber_id;

    match state.queue.enqueue(task).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(EnqueueTaskResponse { task_id }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    match state.diagnostics_task(&task_id).await {
        Ok(Some(task)) => Json(TaskView::from(task)).into_response(),
        Ok(None) => error_response(ForemanError::NotFound(format!("task {task_id}"))),
        Err(e) => error_response(e),
    }
}

async fn get_state(State(state): State<ApiState>) -> Response {
    let agents: Vec<AgentView> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(AgentView::from)
        .collect();
    let pending = match state.queue.pending_count().await {
        Ok(pending) => pending,
        Err(e) => return error_response(e),
    };
    Json(StateResponse {
        agents,
        queue: QueueSummary {
            pending,
            accepting: state.queue.is_accepting(),
        },
    })
    .into_response()
}

async fn system_status(State(state): State<ApiState>) -> Response {
    match state.diagnostics.report().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

impl ApiState {
    /// Task lookup via the store behind the diagnostics view.
    async fn diagnostics_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.diagnostics.get_task(task_id).await
    }
}
