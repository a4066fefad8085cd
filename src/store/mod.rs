//! SQLite-backed persistent store for agents, the capability join table,
//! and task history.
//!
//! The store is the source of truth on restart: the registry and task
//! manager rebuild their in-memory caches from it at boot. All writes are
//! synchronous from the caller's point of view; a mutation returns only
//! after the row is durable.

use crate::{
    models::{AgentCard, AgentStatus, Task, TaskStatus},
    HubError, Result,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        capabilities_json TEXT NOT NULL,
        protocols_json TEXT NOT NULL,
        endpoints_json TEXT NOT NULL,
        metadata_json TEXT,
        status TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        load_score REAL NOT NULL DEFAULT 0.0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_capabilities (
        agent_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        PRIMARY KEY (agent_id, capability)
    )",
    "CREATE INDEX IF NOT EXISTS idx_agent_capabilities_capability
        ON agent_capabilities (capability)",
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        requester_id TEXT NOT NULL,
        assigned_agent_id TEXT,
        priority INTEGER NOT NULL DEFAULT 5,
        timeout INTEGER NOT NULL DEFAULT 300,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        result_json TEXT,
        error TEXT,
        metadata_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks (task_type)",
];

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    agent_id: String,
    name: String,
    version: String,
    capabilities_json: String,
    protocols_json: String,
    endpoints_json: String,
    metadata_json: Option<String>,
    status: String,
    last_heartbeat: String,
    load_score: f64,
    created_at: String,
    updated_at: String,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    task_type: String,
    payload_json: String,
    requester_id: String,
    assigned_agent_id: Option<String>,
    priority: i64,
    timeout: i64,
    status: String,
    created_at: String,
    completed_at: Option<String>,
    result_json: Option<String>,
    error: Option<String>,
    metadata_json: Option<String>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HubError::Internal(anyhow!("malformed timestamp {raw:?}: {e}")))
}

impl TryFrom<AgentRow> for AgentCard {
    type Error = HubError;

    fn try_from(row: AgentRow) -> Result<Self> {
        let status: AgentStatus = row
            .status
            .parse()
            .map_err(|e: String| HubError::Internal(anyhow!(e)))?;
        Ok(AgentCard {
            agent_id: row.agent_id,
            name: row.name,
            version: row.version,
            capabilities: serde_json::from_str(&row.capabilities_json)?,
            protocols: serde_json::from_str(&row.protocols_json)?,
            endpoints: serde_json::from_str(&row.endpoints_json)?,
            metadata: row
                .metadata_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status,
            last_heartbeat: parse_ts(&row.last_heartbeat)?,
            load_score: row.load_score,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = HubError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e: String| HubError::Internal(anyhow!(e)))?;
        Ok(Task {
            task_id: row.task_id,
            task_type: row.task_type,
            payload: serde_json::from_str(&row.payload_json)?,
            requester_id: row.requester_id,
            assigned_agent_id: row.assigned_agent_id,
            priority: row.priority,
            timeout: row.timeout,
            status,
            created_at: parse_ts(&row.created_at)?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            result: row
                .result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: row.error,
            metadata: row
                .metadata_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HubError::Configuration(format!("cannot create {parent:?}: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("store opened at {}", path.display());
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- agents ----

    /// Insert or overwrite an agent card together with its capability
    /// index slice, in one transaction. `created_at` survives overwrites.
    pub async fn upsert_agent(&self, card: &AgentCard) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO agents (agent_id, name, version, capabilities_json, protocols_json, \
             endpoints_json, metadata_json, status, last_heartbeat, load_score, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET \
                name = excluded.name, \
                version = excluded.version, \
                capabilities_json = excluded.capabilities_json, \
                protocols_json = excluded.protocols_json, \
                endpoints_json = excluded.endpoints_json, \
                metadata_json = excluded.metadata_json, \
                status = excluded.status, \
                last_heartbeat = excluded.last_heartbeat, \
                load_score = excluded.load_score, \
                updated_at = excluded.updated_at",
        )
        .bind(&card.agent_id)
        .bind(&card.name)
        .bind(&card.version)
        .bind(serde_json::to_string(&card.capabilities)?)
        .bind(serde_json::to_string(&card.protocols)?)
        .bind(serde_json::to_string(&card.endpoints)?)
        .bind(
            card.metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(card.status.to_string())
        .bind(card.last_heartbeat.to_rfc3339())
        .bind(card.load_score)
        .bind(card.created_at.to_rfc3339())
        .bind(card.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM agent_capabilities WHERE agent_id = ?")
            .bind(&card.agent_id)
            .execute(&mut *tx)
            .await?;

        for capability in &card.capabilities {
            sqlx::query("INSERT INTO agent_capabilities (agent_id, capability) VALUES (?, ?)")
                .bind(&card.agent_id)
                .bind(capability)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load every agent card. Used for the boot-time registry rebuild.
    pub async fn load_agents(&self) -> Result<Vec<AgentCard>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY agent_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AgentCard::try_from).collect()
    }

    /// Persist the mutable liveness fields of an agent: status, heartbeat
    /// timestamp and load score.
    pub async fn update_agent_state(
        &self,
        agent_id: &str,
        status: AgentStatus,
        last_heartbeat: DateTime<Utc>,
        load_score: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agents SET status = ?, last_heartbeat = ?, load_score = ?, updated_at = ? \
             WHERE agent_id = ?",
        )
        .bind(status.to_string())
        .bind(last_heartbeat.to_rfc3339())
        .bind(load_score)
        .bind(updated_at.to_rfc3339())
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    /// Remove an agent and its capability slice.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM agent_capabilities WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    // ---- tasks ----

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (task_id, task_type, payload_json, requester_id, assigned_agent_id, \
             priority, timeout, status, created_at, completed_at, result_json, error, metadata_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(&task.requester_id)
        .bind(&task.assigned_agent_id)
        .bind(task.priority)
        .bind(task.timeout)
        .bind(task.status.to_string())
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|ts| ts.to_rfc3339()))
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&task.error)
        .bind(
            task.metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the mutable lifecycle fields of a task.
    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, assigned_agent_id = ?, completed_at = ?, \
             result_json = ?, error = ? WHERE task_id = ?",
        )
        .bind(task.status.to_string())
        .bind(&task.assigned_agent_id)
        .bind(task.completed_at.map(|ts| ts.to_rfc3339()))
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&task.error)
        .bind(&task.task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("task {}", task.task_id)));
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Load every non-terminal task. Used for the boot-time rebuild of the
    /// active-task map.
    pub async fn load_active_tasks(&self) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE status IN ('pending', 'in_progress')")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Task counts grouped by status, for the metrics view.
    pub async fn task_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentEndpoints;
    use serde_json::json;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::connect(&dir.path().join("hub.db")).await.unwrap();
        (dir, store)
    }

    fn card(agent_id: &str) -> AgentCard {
        let now = Utc::now();
        AgentCard {
            agent_id: agent_id.to_string(),
            name: "Test Agent".to_string(),
            version: "1.0.0".to_string(),
            capabilities: vec!["summary".to_string(), "translation".to_string()],
            protocols: vec!["a2a".to_string()],
            endpoints: AgentEndpoints {
                a2a: "http://localhost:9001/a2a".to_string(),
                health: "http://localhost:9001/health".to_string(),
                extra: Default::default(),
            },
            metadata: Some(json!({"specialization": "text"})),
            status: AgentStatus::Online,
            last_heartbeat: now,
            load_score: 0.25,
            created_at: now,
            updated_at: now,
        }
    }

    fn task(task_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            task_type: "summary".to_string(),
            payload: json!({"text": "hi"}),
            requester_id: "r1".to_string(),
            assigned_agent_id: None,
            priority: 5,
            timeout: 300,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn agent_round_trip() {
        let (_dir, store) = open_store().await;
        let original = card("a1");
        store.upsert_agent(&original).await.unwrap();

        let loaded = store.load_agents().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let agent = &loaded[0];
        assert_eq!(agent.agent_id, original.agent_id);
        assert_eq!(agent.capabilities, original.capabilities);
        assert_eq!(agent.endpoints.a2a, original.endpoints.a2a);
        assert_eq!(agent.metadata, original.metadata);
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.load_score, original.load_score);
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let (_dir, store) = open_store().await;
        let first = card("a1");
        store.upsert_agent(&first).await.unwrap();

        let mut second = card("a1");
        second.version = "2.0.0".to_string();
        second.created_at = Utc::now() + chrono::Duration::hours(1);
        store.upsert_agent(&second).await.unwrap();

        let loaded = store.load_agents().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, "2.0.0");
        assert_eq!(loaded[0].created_at, first.created_at);
    }

    #[tokio::test]
    async fn update_agent_state_requires_existing_row() {
        let (_dir, store) = open_store().await;
        let err = store
            .update_agent_state("ghost", AgentStatus::Offline, Utc::now(), 0.0, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));

        store.upsert_agent(&card("a1")).await.unwrap();
        store
            .update_agent_state("a1", AgentStatus::Busy, Utc::now(), 0.97, Utc::now())
            .await
            .unwrap();
        let loaded = store.load_agents().await.unwrap();
        assert_eq!(loaded[0].status, AgentStatus::Busy);
        assert_eq!(loaded[0].load_score, 0.97);
    }

    #[tokio::test]
    async fn delete_agent_removes_card() {
        let (_dir, store) = open_store().await;
        store.upsert_agent(&card("a1")).await.unwrap();
        store.delete_agent("a1").await.unwrap();
        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_agent("a1").await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn task_lifecycle_persists() {
        let (_dir, store) = open_store().await;
        let mut t = task("t1");
        store.insert_task(&t).await.unwrap();

        t.status = TaskStatus::InProgress;
        t.assigned_agent_id = Some("a1".to_string());
        store.update_task(&t).await.unwrap();

        t.status = TaskStatus::Completed;
        t.completed_at = Some(Utc::now());
        t.result = Some(json!({"sum": "hi"}));
        store.update_task(&t).await.unwrap();

        let loaded = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.assigned_agent_id.as_deref(), Some("a1"));
        assert_eq!(loaded.result, Some(json!({"sum": "hi"})));
        assert!(loaded.completed_at.unwrap() >= loaded.created_at);
    }

    #[tokio::test]
    async fn active_tasks_excludes_terminal() {
        let (_dir, store) = open_store().await;
        store.insert_task(&task("t1")).await.unwrap();

        let mut done = task("t2");
        store.insert_task(&done).await.unwrap();
        done.status = TaskStatus::Failed;
        done.error = Some("boom".to_string());
        done.completed_at = Some(Utc::now());
        store.update_task(&done).await.unwrap();

        let active = store.load_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "t1");

        let counts = store.task_status_counts().await.unwrap();
        let lookup: std::collections::HashMap<_, _> = counts.into_iter().collect();
        assert_eq!(lookup.get("pending"), Some(&1));
        assert_eq!(lookup.get("failed"), Some(&1));
    }
}
