//! HTTP surface: JSON plumbing between the wire and the components.
//!
//! Handlers stay thin: decode the body, bind it to the record types in
//! `validation`, invoke the component, encode the envelope. Every body
//! carries a top-level `success` flag; transport success and operation
//! success are deliberately separate (an unreachable agent or a failed
//! delegation is a 200 with `success: false`).

use crate::{
    config::HubConfig,
    dispatch::{DispatchResult, Dispatcher},
    liveness::LivenessTracker,
    models::{AgentCard, AgentStatus, Task, TaskStatus},
    registry::AgentRegistry,
    tasks::TaskManager,
    validation, HubError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

const SERVICE_NAME: &str = "a2a-hub";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_REGISTER: &str = "/agents/register";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_BY_ID: &str = "/agents/{agent_id}";
const ROUTE_HEARTBEAT: &str = "/agents/{agent_id}/heartbeat";
const ROUTE_DISCOVER: &str = "/a2a/discover";
const ROUTE_DELEGATE: &str = "/a2a/delegate";
const ROUTE_TASK_BY_ID: &str = "/a2a/task/{task_id}";
const ROUTE_TASK_COMPLETE: &str = "/a2a/task/{task_id}/complete";
const ROUTE_HEALTH: &str = "/health";
const ROUTE_METRICS: &str = "/metrics";

const ERROR_INTERNAL_SERVER: &str = "internal server error";

/// How many ranked candidates the discovery endpoint returns.
const DISCOVERY_LIMIT: usize = 5;

#[derive(Clone)]
pub struct ApiServer {
    config: HubConfig,
    registry: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    dispatcher: Arc<Dispatcher>,
    liveness: Arc<LivenessTracker>,
    started_at: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct AgentEnvelope {
    pub success: bool,
    pub agent: AgentCard,
}

#[derive(Debug, Serialize)]
pub struct AgentListEnvelope {
    pub success: bool,
    pub agents: Vec<AgentCard>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskEnvelope {
    pub success: bool,
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct DelegateEnvelope {
    pub success: bool,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    load_score: f64,
}

#[derive(Debug, Deserialize)]
struct DiscoverRequest {
    task_type: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ErrorBody>)>;

/// Map the error taxonomy onto the envelope/status matrix: validation is
/// a 400, unknown ids are 404, protocol-level failures keep transport
/// success (200 with `success: false`), everything else is a 500 with
/// the details kept server-side.
fn error_response(err: HubError) -> (StatusCode, Json<ErrorBody>) {
    let (status, message) = match &err {
        HubError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        HubError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        HubError::UnreachableAgent(_)
        | HubError::NoSuitableAgent
        | HubError::DelegationFailed(_)
        | HubError::IllegalTransition(_) => (StatusCode::OK, err.to_string()),
        _ => {
            error!("request failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_INTERNAL_SERVER.to_string(),
            )
        }
    };
    (
        status,
        Json(ErrorBody {
            success: false,
            error: message,
        }),
    )
}

impl ApiServer {
    pub fn new(
        config: HubConfig,
        registry: Arc<AgentRegistry>,
        tasks: Arc<TaskManager>,
        dispatcher: Arc<Dispatcher>,
        liveness: Arc<LivenessTracker>,
    ) -> Self {
        Self {
            config,
            registry,
            tasks,
            dispatcher,
            liveness,
            started_at: Instant::now(),
        }
    }

    /// Serve until `shutdown` fires, then drain in-flight handlers.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.build_router();

        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| HubError::Internal(e.into()))?;

        info!(
            "hub listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| HubError::Internal(e.into()))?;

        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = if self.config.allowed_origins.is_empty() {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
                .allow_origin(
                    self.config
                        .allowed_origins
                        .iter()
                        .filter_map(|origin| origin.parse().ok())
                        .collect::<Vec<_>>(),
                )
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::DELETE,
                ])
                .allow_headers([axum::http::header::CONTENT_TYPE])
        };

        Router::new()
            .route(ROUTE_REGISTER, post(register_agent))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_AGENT_BY_ID, get(get_agent).delete(unregister_agent))
            .route(ROUTE_HEARTBEAT, post(agent_heartbeat))
            .route(ROUTE_DISCOVER, post(discover_agents))
            .route(ROUTE_DELEGATE, post(delegate_task))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_COMPLETE, post(complete_task))
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_METRICS, get(get_metrics))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn register_agent(
    State(server): State<ApiServer>,
    Json(body): Json<Value>,
) -> ApiResult<Json<AgentEnvelope>> {
    let card = validation::parse_agent_card(body).map_err(error_response)?;
    let agent = server.registry.register(card).await.map_err(error_response)?;
    Ok(Json(AgentEnvelope {
        success: true,
        agent,
    }))
}

async fn list_agents(
    State(server): State<ApiServer>,
    Query(query): Query<ListAgentsQuery>,
) -> ApiResult<Json<AgentListEnvelope>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AgentStatus>)
        .transpose()
        .map_err(|e| error_response(HubError::Validation(e)))?;

    let agents = server.registry.list(status).await;
    let count = agents.len();
    Ok(Json(AgentListEnvelope {
        success: true,
        agents,
        count,
    }))
}

async fn get_agent(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentEnvelope>> {
    match server.registry.get(&agent_id).await {
        Some(agent) => Ok(Json(AgentEnvelope {
            success: true,
            agent,
        })),
        None => Err(error_response(HubError::NotFound(format!(
            "agent {agent_id}"
        )))),
    }
}

async fn unregister_agent(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    server
        .registry
        .unregister(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "success": true, "agent_id": agent_id })))
}

async fn agent_heartbeat(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: HeartbeatRequest = serde_json::from_value(body)
        .map_err(|e| error_response(HubError::Validation(format!("invalid heartbeat: {e}"))))?;

    let status = server
        .liveness
        .record_heartbeat(&agent_id, req.load_score)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "success": true,
        "agent_id": agent_id,
        "status": status,
    })))
}

async fn discover_agents(
    State(server): State<ApiServer>,
    Json(body): Json<Value>,
) -> ApiResult<Json<AgentListEnvelope>> {
    let req: DiscoverRequest = serde_json::from_value(body).map_err(|e| {
        error_response(HubError::Validation(format!("invalid discovery request: {e}")))
    })?;

    let agents: Vec<AgentCard> = server
        .dispatcher
        .rank_candidates(&req.task_type, &req.capabilities)
        .await
        .into_iter()
        .take(DISCOVERY_LIMIT)
        .map(|candidate| candidate.agent)
        .collect();
    let count = agents.len();

    Ok(Json(AgentListEnvelope {
        success: true,
        agents,
        count,
    }))
}

async fn delegate_task(
    State(server): State<ApiServer>,
    Json(body): Json<Value>,
) -> ApiResult<Json<DelegateEnvelope>> {
    let req = validation::parse_task_request(body).map_err(error_response)?;
    let outcome = server.dispatcher.dispatch(req).await.map_err(error_response)?;

    let envelope = match outcome {
        DispatchResult::Dispatched { task, agent } => DelegateEnvelope {
            success: true,
            task_id: task.task_id,
            status: task.status,
            assigned_agent: Some(agent.agent_id),
            error: None,
        },
        DispatchResult::NoSuitableAgent { task } => DelegateEnvelope {
            success: false,
            task_id: task.task_id,
            status: task.status,
            assigned_agent: None,
            error: task.error,
        },
        DispatchResult::DelegationFailed { task, agent, error } => DelegateEnvelope {
            success: false,
            task_id: task.task_id,
            status: task.status,
            assigned_agent: Some(agent.agent_id),
            error: Some(error),
        },
    };
    Ok(Json(envelope))
}

async fn get_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskEnvelope>> {
    match server.tasks.get(&task_id).await.map_err(error_response)? {
        Some(task) => Ok(Json(TaskEnvelope {
            success: true,
            task,
        })),
        None => Err(error_response(HubError::NotFound(format!(
            "task {task_id}"
        )))),
    }
}

async fn complete_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: CompletionRequest = serde_json::from_value(body)
        .map_err(|e| error_response(HubError::Validation(format!("invalid completion: {e}"))))?;

    let task = if req.success {
        server
            .tasks
            .complete(&task_id, req.result.unwrap_or_else(|| json!({})))
            .await
    } else {
        server
            .tasks
            .fail(
                &task_id,
                req.error.unwrap_or_else(|| "unknown error".to_string()),
            )
            .await
    }
    .map_err(error_response)?;

    Ok(Json(json!({
        "success": true,
        "task_id": task.task_id,
        "status": task.status,
    })))
}

async fn health_check(State(server): State<ApiServer>) -> Json<Value> {
    Json(json!({
        "success": true,
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
        "agents_online": server.registry.online_count().await,
    }))
}

async fn get_metrics(State(server): State<ApiServer>) -> ApiResult<Json<Value>> {
    let agents = server.registry.list(None).await;
    let online = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Online)
        .count();

    // Zero-fill so every status shows up even with no tasks in it.
    let mut tasks = serde_json::Map::new();
    for status in [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ] {
        tasks.insert(status.to_string(), json!(0));
    }
    for (status, count) in server.tasks.status_counts().await.map_err(error_response)? {
        tasks.insert(status, json!(count));
    }

    Ok(Json(json!({
        "success": true,
        "agents": {
            "total": agents.len(),
            "online": online,
            "offline": agents.len() - online,
        },
        "tasks": tasks,
        "system": {
            "uptime_seconds": server.started_at.elapsed().as_secs(),
            "version": SERVICE_VERSION,
        },
    })))
}
