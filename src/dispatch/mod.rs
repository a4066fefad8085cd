//! Dispatcher: candidate scoring and selection, outbound delegation, and
//! the background timeout sweeper.
//!
//! Delegation is fire-and-forget: a 2xx from the agent only means the
//! task was accepted. Completion arrives later through the completion
//! endpoint; the dispatcher never blocks on it and never retries a
//! failed delegation against a different agent.

use crate::{
    models::{AgentCard, AgentStatus, Task, TaskRequest},
    outbound::AgentClient,
    registry::AgentRegistry,
    tasks::TaskManager,
    Result,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure reason recorded when discovery finds no candidates.
pub const NO_SUITABLE_AGENTS: &str = "no suitable agents";

/// A candidate agent with its dispatch score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub agent: AgentCard,
    pub score: f64,
}

/// Outcome of a dispatch attempt. Infrastructure failures still surface
/// as `Err`; these three are protocol-level outcomes with the task state
/// already recorded.
#[derive(Debug)]
pub enum DispatchResult {
    Dispatched { task: Task, agent: AgentCard },
    NoSuitableAgent { task: Task },
    DelegationFailed { task: Task, agent: AgentCard, error: String },
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    client: Arc<AgentClient>,
}

/// Dispatch score for one agent, or `None` when the agent does not
/// qualify.
///
/// With explicit required capabilities the score is the capability match
/// ratio weighted by idleness; a zero match ratio disqualifies. When
/// routing by task type alone, any agent advertising the type scores by
/// idleness.
fn score_agent(card: &AgentCard, task_type: &str, required: Option<&[String]>) -> Option<f64> {
    match required {
        Some(caps) if !caps.is_empty() => {
            let matched = caps
                .iter()
                .filter(|c| card.capabilities.contains(c))
                .count();
            if matched == 0 {
                return None;
            }
            let match_ratio = matched as f64 / caps.len() as f64;
            Some(match_ratio * (1.0 - card.load_score))
        }
        _ => {
            if card.capabilities.iter().any(|c| c == task_type) {
                Some(1.0 - card.load_score)
            } else {
                None
            }
        }
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        tasks: Arc<TaskManager>,
        client: Arc<AgentClient>,
    ) -> Self {
        Self {
            registry,
            tasks,
            client,
        }
    }

    /// Rank the ONLINE candidates for a task, best first.
    ///
    /// Ties break on lower load, then earlier heartbeat, then agent id,
    /// so selection is deterministic for identical inputs.
    pub async fn rank_candidates(
        &self,
        task_type: &str,
        required: &[String],
    ) -> Vec<ScoredCandidate> {
        let required = (!required.is_empty()).then_some(required);
        let cards = self.registry.discover(task_type, required).await;

        let mut candidates: Vec<ScoredCandidate> = cards
            .into_iter()
            .filter(|card| card.status == AgentStatus::Online)
            .filter_map(|card| {
                score_agent(&card, task_type, required).map(|score| ScoredCandidate {
                    agent: card,
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.agent.load_score.total_cmp(&b.agent.load_score))
                .then_with(|| a.agent.last_heartbeat.cmp(&b.agent.last_heartbeat))
                .then_with(|| a.agent.agent_id.cmp(&b.agent.agent_id))
        });
        candidates
    }

    /// Create a task from a validated request and dispatch it to the
    /// best-fit agent.
    pub async fn dispatch(&self, req: TaskRequest) -> Result<DispatchResult> {
        let required = req.required_capabilities.clone();
        let task = self.tasks.create(req).await?;

        let mut candidates = self.rank_candidates(&task.task_type, &required).await;
        if candidates.is_empty() {
            warn!("no candidates for task {} ({})", task.task_id, task.task_type);
            let task = self
                .tasks
                .fail(&task.task_id, NO_SUITABLE_AGENTS.to_string())
                .await?;
            return Ok(DispatchResult::NoSuitableAgent { task });
        }
        let agent = candidates.remove(0).agent;

        let task = self.tasks.assign(&task.task_id, &agent.agent_id).await?;

        let payload = delegation_payload(&task);
        match self.client.delegate(&agent.endpoints.a2a, &payload).await {
            Ok(()) => {
                info!(
                    "task {} delegated to agent {}",
                    task.task_id, agent.agent_id
                );
                Ok(DispatchResult::Dispatched { task, agent })
            }
            Err(error) => {
                warn!(
                    "delegation of task {} to agent {} failed: {error}",
                    task.task_id, agent.agent_id
                );
                let task = self.tasks.fail(&task.task_id, error.clone()).await?;
                Ok(DispatchResult::DelegationFailed { task, agent, error })
            }
        }
    }

    /// Transition every expired IN_PROGRESS task to TIMEOUT. Returns how
    /// many tasks were swept.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired = self.tasks.expired_tasks(now).await;
        let mut swept = 0;
        for task in expired {
            let message = format!("task timed out after {}s", task.timeout);
            match self.tasks.timeout(&task.task_id, message).await {
                Ok(_) => swept += 1,
                // A completion can race the sweep; the terminal state wins.
                Err(e) => debug!("sweep skipped task {}: {e}", task.task_id),
            }
        }
        swept
    }

    /// Background loop enforcing per-task deadlines and evicting stale
    /// finalized tasks from the active map.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval_secs: u64,
        retention_secs: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("timeout sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let swept = self.sweep_expired(now).await;
                        if swept > 0 {
                            info!("swept {swept} timed out tasks");
                        }
                        self.tasks.evict_finalized(now, retention_secs).await;
                    }
                }
            }
        })
    }
}

/// The payload forwarded verbatim to the chosen agent's a2a endpoint.
fn delegation_payload(task: &Task) -> Value {
    json!({
        "task_id": task.task_id,
        "task_type": task.task_type,
        "payload": task.payload,
        "requester_id": task.requester_id,
        "priority": task.priority,
        "timeout": task.timeout,
    })
}
