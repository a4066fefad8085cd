//! Task lifecycle: the PENDING -> IN_PROGRESS -> terminal state machine,
//! the active-task map, and its persistence.
//!
//! Every mutation is written to the store before the in-memory map is
//! updated, so a crash between the two leaves the store ahead, never
//! behind. Terminal states are sticky; re-applying the same terminal
//! state is treated as an idempotent repeat.

use crate::{
    models::{Task, TaskRequest, TaskStatus},
    store::Store,
    HubError, Result,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct TaskManager {
    active: RwLock<HashMap<String, Task>>,
    store: Arc<Store>,
}

impl TaskManager {
    /// Build the manager, rebuilding the active-task map from the store's
    /// non-terminal rows.
    pub async fn new(store: Arc<Store>) -> Result<Self> {
        let tasks = store.load_active_tasks().await?;
        let mut active = HashMap::with_capacity(tasks.len());
        for task in tasks {
            active.insert(task.task_id.clone(), task);
        }
        if !active.is_empty() {
            info!("restored {} active tasks from store", active.len());
        }
        Ok(Self {
            active: RwLock::new(active),
            store,
        })
    }

    /// Create a task from a validated request: persist it as PENDING and
    /// insert it into the active map.
    pub async fn create(&self, req: TaskRequest) -> Result<Task> {
        let task = Task::from_request(req, Utc::now());
        self.store.insert_task(&task).await?;
        self.active
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        info!("task {} created ({})", task.task_id, task.task_type);
        Ok(task)
    }

    /// Move a PENDING task to IN_PROGRESS and pin its assignee.
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(HubError::IllegalTransition(format!(
                "task {task_id} is {} and cannot be assigned",
                task.status
            )));
        }
        task.assigned_agent_id = Some(agent_id.to_string());
        task.status = TaskStatus::InProgress;
        self.persist(task.clone()).await?;
        info!("task {task_id} assigned to agent {agent_id}");
        Ok(task)
    }

    /// Finalize an IN_PROGRESS task as COMPLETED with its result.
    pub async fn complete(&self, task_id: &str, result: Value) -> Result<Task> {
        let mut task = self.require(task_id).await?;
        match task.status {
            TaskStatus::InProgress => {}
            TaskStatus::Completed => return Ok(task),
            other => {
                return Err(HubError::IllegalTransition(format!(
                    "task {task_id} is {other} and cannot be completed"
                )))
            }
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        self.persist(task.clone()).await?;
        info!("task {task_id} completed");
        Ok(task)
    }

    /// Finalize a task as FAILED. Valid from PENDING or IN_PROGRESS.
    pub async fn fail(&self, task_id: &str, error: String) -> Result<Task> {
        let mut task = self.require(task_id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::InProgress => {}
            TaskStatus::Failed => return Ok(task),
            other => {
                return Err(HubError::IllegalTransition(format!(
                    "task {task_id} is {other} and cannot be failed"
                )))
            }
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.clone());
        task.completed_at = Some(Utc::now());
        self.persist(task.clone()).await?;
        info!("task {task_id} failed: {error}");
        Ok(task)
    }

    /// Finalize a task as TIMEOUT. Invoked only by the timeout sweeper.
    pub async fn timeout(&self, task_id: &str, error: String) -> Result<Task> {
        let mut task = self.require(task_id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::InProgress => {}
            TaskStatus::Timeout => return Ok(task),
            other => {
                return Err(HubError::IllegalTransition(format!(
                    "task {task_id} is {other} and cannot time out"
                )))
            }
        }
        task.status = TaskStatus::Timeout;
        task.error = Some(error);
        task.completed_at = Some(Utc::now());
        self.persist(task.clone()).await?;
        info!("task {task_id} timed out");
        Ok(task)
    }

    /// Fetch a task, falling back to the store for finalized tasks that
    /// were evicted from the active map.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        if let Some(task) = self.active.read().await.get(task_id) {
            return Ok(Some(task.clone()));
        }
        self.store.get_task(task_id).await
    }

    /// IN_PROGRESS tasks whose per-task deadline has passed.
    pub async fn expired_tasks(&self, now: DateTime<Utc>) -> Vec<Task> {
        let active = self.active.read().await;
        active
            .values()
            .filter(|task| {
                task.status == TaskStatus::InProgress
                    && (now - task.created_at).num_seconds() > task.timeout
            })
            .cloned()
            .collect()
    }

    /// Drop finalized tasks older than the retention window from the
    /// active map. The store keeps their history.
    pub async fn evict_finalized(&self, now: DateTime<Utc>, retention_secs: u64) -> usize {
        let cutoff = now - chrono::Duration::seconds(retention_secs as i64);
        let mut active = self.active.write().await;
        let before = active.len();
        active.retain(|_, task| {
            !(task.status.is_terminal()
                && task.completed_at.map_or(true, |done| done < cutoff))
        });
        let evicted = before - active.len();
        if evicted > 0 {
            debug!("evicted {evicted} finalized tasks from the active map");
        }
        evicted
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Task counts by status, for the metrics view.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        self.store.task_status_counts().await
    }

    async fn require(&self, task_id: &str) -> Result<Task> {
        self.get(task_id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))
    }

    async fn persist(&self, task: Task) -> Result<()> {
        self.store.update_task(&task).await?;
        self.active
            .write()
            .await
            .insert(task.task_id.clone(), task);
        Ok(())
    }
}
