use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default task priority when the requester does not supply one.
pub const DEFAULT_PRIORITY: i64 = 5;
/// Default per-task deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

/// Liveness state of a registered agent.
///
/// `Busy` is advisory and driven by the agent's own load reports; `Error`
/// is reserved for agents whose endpoints misbehave after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid agent status: {other:?}")),
        }
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Pending` -> `InProgress` -> one of the
/// terminal states. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("invalid task status: {other:?}")),
        }
    }
}

/// Endpoint map advertised by an agent.
///
/// `a2a` (delegation intake) and `health` are required by the protocol;
/// any additional endpoints the agent advertises are kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoints {
    pub a2a: String,
    pub health: String,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Self-description a worker presents at registration, plus the liveness
/// and load bookkeeping the hub stamps onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub protocols: Vec<String>,
    pub endpoints: AgentEndpoints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub load_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration request body, before the hub stamps server-side fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCardRequest {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub protocols: Vec<String>,
    pub endpoints: AgentEndpoints,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl AgentCard {
    /// Build a card from a validated registration request.
    ///
    /// `created_at` is carried over from the prior card on re-registration
    /// so that it reflects first registration, not the latest overwrite.
    pub fn from_registration(
        req: AgentCardRequest,
        now: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: req.agent_id,
            name: req.name,
            version: req.version,
            capabilities: req.capabilities,
            protocols: req.protocols,
            endpoints: req.endpoints,
            metadata: req.metadata,
            status: AgentStatus::Online,
            last_heartbeat: now,
            load_score: 0.0,
            created_at,
            updated_at: now,
        }
    }
}

/// A unit of work moving through the dispatch lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub requester_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    pub priority: i64,
    pub timeout: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_SECS
}

/// Delegation request body.
///
/// `required_capabilities` steers dispatcher scoring; when absent the task
/// routes by `task_type` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub task_type: String,
    pub payload: Value,
    pub requester_id: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl Task {
    /// Build a pending task from a validated request, generating an id
    /// when the requester did not supply one.
    pub fn from_request(req: TaskRequest, now: DateTime<Utc>) -> Self {
        Self {
            task_id: req
                .task_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: req.task_type,
            payload: req.payload,
            requester_id: req.requester_id,
            assigned_agent_id: None,
            priority: req.priority,
            timeout: req.timeout,
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
            result: None,
            error: None,
            metadata: req.metadata,
        }
    }
}

/// Clamp a reported load score into [0, 1]. Non-finite input maps to 0.
pub fn clamp_load(load: f64) -> f64 {
    if load.is_finite() {
        load.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
