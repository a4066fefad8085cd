//! Agent registry: the in-memory mirror of registered agents plus the
//! capability index, guarded by a single writer lock.
//!
//! The registry owns all agent-card mutation. Every write goes to the
//! store first and to memory second, so a crash between the two leaves
//! the store ahead, never behind. The capability index is rewritten in
//! the same critical section as the agent map and can never diverge.

pub mod index;

use crate::{
    models::{clamp_load, AgentCard, AgentCardRequest, AgentStatus},
    outbound::AgentClient,
    store::Store,
    HubError, Result,
};
use chrono::{DateTime, Utc};
use index::CapabilityIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct RegistryInner {
    agents: HashMap<String, AgentCard>,
    index: CapabilityIndex,
}

pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    store: Arc<Store>,
    client: Arc<AgentClient>,
}

impl AgentRegistry {
    /// Build the registry, rebuilding the agent map and capability index
    /// from the store.
    pub async fn new(store: Arc<Store>, client: Arc<AgentClient>) -> Result<Self> {
        let cards = store.load_agents().await?;
        let mut agents = HashMap::with_capacity(cards.len());
        let mut index = CapabilityIndex::new();
        for card in cards {
            index.set_agent(&card.agent_id, &card.capabilities);
            agents.insert(card.agent_id.clone(), card);
        }
        if !agents.is_empty() {
            info!("restored {} agents from store", agents.len());
        }
        Ok(Self {
            inner: RwLock::new(RegistryInner { agents, index }),
            store,
            client,
        })
    }

    /// Register or overwrite an agent.
    ///
    /// The card must already be validated. The agent's health endpoint is
    /// probed synchronously; on failure nothing is persisted and the
    /// caller gets `UnreachableAgent`. On success the card is stored with
    /// `status = Online` and a fresh heartbeat, and the capability index
    /// slice for the agent is rewritten. Re-registration overwrites all
    /// state except `created_at`.
    pub async fn register(&self, req: AgentCardRequest) -> Result<AgentCard> {
        let agent_id = req.agent_id.clone();

        if !self.client.health_check(&req.endpoints.health).await {
            warn!("agent {agent_id} failed registration health probe");
            return Err(HubError::UnreachableAgent(format!(
                "{agent_id} failed health probe at {}",
                req.endpoints.health
            )));
        }

        let now = Utc::now();
        let created_at = {
            let inner = self.inner.read().await;
            inner
                .agents
                .get(&agent_id)
                .map(|existing| existing.created_at)
                .unwrap_or(now)
        };

        let card = AgentCard::from_registration(req, now, created_at);
        self.store.upsert_agent(&card).await?;

        let mut inner = self.inner.write().await;
        inner.index.set_agent(&card.agent_id, &card.capabilities);
        inner.agents.insert(card.agent_id.clone(), card.clone());
        drop(inner);

        info!("agent {agent_id} registered");
        Ok(card)
    }

    /// Remove an agent from the registry, index and store.
    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        self.store.delete_agent(agent_id).await?;

        let mut inner = self.inner.write().await;
        inner.agents.remove(agent_id);
        inner.index.remove_agent(agent_id);
        drop(inner);

        info!("agent {agent_id} unregistered");
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentCard> {
        let inner = self.inner.read().await;
        inner.agents.get(agent_id).cloned()
    }

    /// List agents, optionally filtered by status, ordered by id.
    pub async fn list(&self, status: Option<AgentStatus>) -> Vec<AgentCard> {
        let inner = self.inner.read().await;
        let mut cards: Vec<AgentCard> = inner
            .agents
            .values()
            .filter(|card| status.map_or(true, |s| card.status == s))
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        cards
    }

    /// Update an agent's load score, clamped to [0, 1].
    pub async fn update_load(&self, agent_id: &str, load_score: f64) -> Result<()> {
        let card = self
            .get(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        let load = clamp_load(load_score);
        let now = Utc::now();
        self.store
            .update_agent_state(agent_id, card.status, card.last_heartbeat, load, now)
            .await?;

        let mut inner = self.inner.write().await;
        if let Some(card) = inner.agents.get_mut(agent_id) {
            card.load_score = load;
            card.updated_at = now;
        }
        Ok(())
    }

    /// Flip an agent's status without touching heartbeat or load. Used by
    /// the liveness tracker.
    pub async fn mark_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let card = self
            .get(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        let now = Utc::now();
        self.store
            .update_agent_state(agent_id, status, card.last_heartbeat, card.load_score, now)
            .await?;

        let mut inner = self.inner.write().await;
        if let Some(card) = inner.agents.get_mut(agent_id) {
            card.status = status;
            card.updated_at = now;
        }
        Ok(())
    }

    /// Record a liveness observation: heartbeat timestamp, clamped load
    /// and the resulting status, persisted before the map is updated.
    pub async fn apply_heartbeat(
        &self,
        agent_id: &str,
        heartbeat_at: DateTime<Utc>,
        load_score: f64,
        status: AgentStatus,
    ) -> Result<()> {
        if self.get(agent_id).await.is_none() {
            return Err(HubError::NotFound(format!("agent {agent_id}")));
        }
        let load = clamp_load(load_score);
        let now = Utc::now();
        self.store
            .update_agent_state(agent_id, status, heartbeat_at, load, now)
            .await?;

        let mut inner = self.inner.write().await;
        if let Some(card) = inner.agents.get_mut(agent_id) {
            card.last_heartbeat = heartbeat_at;
            card.load_score = load;
            card.status = status;
            card.updated_at = now;
        }
        Ok(())
    }

    /// Candidate cards for a task, straight from the capability index.
    /// No status filtering and no ranking here; both belong to the
    /// dispatcher.
    pub async fn discover(&self, task_type: &str, required: Option<&[String]>) -> Vec<AgentCard> {
        let inner = self.inner.read().await;
        inner
            .index
            .discover(task_type, required)
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect()
    }

    /// Agents whose last heartbeat is older than the liveness window.
    pub async fn stale_agents(&self, now: DateTime<Utc>, window_secs: u64) -> Vec<AgentCard> {
        let cutoff = now - chrono::Duration::seconds(window_secs as i64);
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .filter(|card| card.last_heartbeat < cutoff)
            .cloned()
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .filter(|card| card.status == AgentStatus::Online)
            .count()
    }

    pub async fn count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.agents.len()
    }

    /// Invariant check used by tests: every (capability, agent) pair in
    /// the index has a matching card and vice versa.
    #[cfg(test)]
    pub async fn index_is_coherent(&self) -> bool {
        let inner = self.inner.read().await;
        let mut expected: Vec<(String, String)> = inner
            .agents
            .values()
            .flat_map(|card| {
                card.capabilities
                    .iter()
                    .map(|cap| (cap.clone(), card.agent_id.clone()))
            })
            .collect();
        let mut actual = inner.index.entries();
        expected.sort();
        actual.sort();
        expected == actual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::models::AgentEndpoints;
    use serde_json::json;

    async fn fixture() -> (tempfile::TempDir, Arc<Store>, Arc<AgentClient>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::connect(&dir.path().join("hub.db")).await.unwrap());
        let config = HubConfig {
            probe_timeout_secs: 2,
            ..HubConfig::default()
        };
        let client = Arc::new(AgentClient::new(&config).unwrap());
        (dir, store, client)
    }

    fn request(agent_id: &str, base_url: &str, capabilities: &[&str]) -> AgentCardRequest {
        AgentCardRequest {
            agent_id: agent_id.to_string(),
            name: format!("{agent_id} worker"),
            version: "1.0.0".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            protocols: vec!["a2a".to_string()],
            endpoints: AgentEndpoints {
                a2a: format!("{base_url}/a2a"),
                health: format!("{base_url}/health"),
                extra: Default::default(),
            },
            metadata: Some(json!({"test": true})),
        }
    }

    async fn healthy_worker() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        server
    }

    #[tokio::test]
    async fn register_round_trip() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store, client).await.unwrap();
        let worker = healthy_worker().await;

        let req = request("a1", &worker.url(), &["summary"]);
        let card = registry.register(req.clone()).await.unwrap();
        assert_eq!(card.status, AgentStatus::Online);
        assert_eq!(card.load_score, 0.0);

        let fetched = registry.get("a1").await.unwrap();
        assert_eq!(fetched.agent_id, req.agent_id);
        assert_eq!(fetched.name, req.name);
        assert_eq!(fetched.capabilities, req.capabilities);
        assert_eq!(fetched.endpoints.a2a, req.endpoints.a2a);
        assert_eq!(fetched.metadata, req.metadata);
        assert!(registry.index_is_coherent().await);
    }

    #[tokio::test]
    async fn unreachable_agent_is_not_persisted() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store.clone(), client).await.unwrap();

        // Nothing listens on this port.
        let req = request("a1", "http://127.0.0.1:1", &["summary"]);
        let err = registry.register(req).await.unwrap_err();
        assert!(matches!(err, HubError::UnreachableAgent(_)));
        assert!(registry.get("a1").await.is_none());
        assert!(store.load_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reregistration_overwrites_but_keeps_created_at() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store, client).await.unwrap();
        let worker = healthy_worker().await;

        let first = registry
            .register(request("a1", &worker.url(), &["summary"]))
            .await
            .unwrap();

        let second = registry
            .register(request("a1", &worker.url(), &["translation"]))
            .await
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(registry.count().await, 1);

        // The index slice was rewritten, not extended.
        assert!(registry.discover("summary", None).await.is_empty());
        assert_eq!(registry.discover("translation", None).await.len(), 1);
        assert!(registry.index_is_coherent().await);
    }

    #[tokio::test]
    async fn load_updates_are_clamped() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store, client).await.unwrap();
        let worker = healthy_worker().await;
        registry
            .register(request("a1", &worker.url(), &["summary"]))
            .await
            .unwrap();

        registry.update_load("a1", 3.5).await.unwrap();
        assert_eq!(registry.get("a1").await.unwrap().load_score, 1.0);

        registry.update_load("a1", -1.0).await.unwrap();
        assert_eq!(registry.get("a1").await.unwrap().load_score, 0.0);

        assert!(matches!(
            registry.update_load("ghost", 0.5).await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store, client).await.unwrap();
        let worker = healthy_worker().await;
        registry
            .register(request("a1", &worker.url(), &["summary"]))
            .await
            .unwrap();
        registry
            .register(request("a2", &worker.url(), &["summary"]))
            .await
            .unwrap();

        registry
            .mark_status("a2", AgentStatus::Offline)
            .await
            .unwrap();

        assert_eq!(registry.list(None).await.len(), 2);
        let online = registry.list(Some(AgentStatus::Online)).await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].agent_id, "a1");
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn unregister_removes_agent_and_index_slice() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store.clone(), client).await.unwrap();
        let worker = healthy_worker().await;
        registry
            .register(request("a1", &worker.url(), &["summary"]))
            .await
            .unwrap();

        registry.unregister("a1").await.unwrap();
        assert!(registry.get("a1").await.is_none());
        assert!(registry.discover("summary", None).await.is_empty());
        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(matches!(
            registry.unregister("a1").await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn restart_rebuilds_registry_from_store() {
        let (_dir, store, client) = fixture().await;
        {
            let registry = AgentRegistry::new(store.clone(), client.clone())
                .await
                .unwrap();
            let worker = healthy_worker().await;
            registry
                .register(request("a1", &worker.url(), &["summary", "vision"]))
                .await
                .unwrap();
        }

        // A fresh registry over the same store sees the same state.
        let revived = AgentRegistry::new(store, client).await.unwrap();
        assert_eq!(revived.count().await, 1);
        let card = revived.get("a1").await.unwrap();
        assert_eq!(card.capabilities, vec!["summary", "vision"]);
        assert_eq!(revived.discover("vision", None).await.len(), 1);
        assert!(revived.index_is_coherent().await);
    }

    #[tokio::test]
    async fn stale_agents_respects_window() {
        let (_dir, store, client) = fixture().await;
        let registry = AgentRegistry::new(store, client).await.unwrap();
        let worker = healthy_worker().await;
        registry
            .register(request("a1", &worker.url(), &["summary"]))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(registry.stale_agents(now, 90).await.is_empty());

        let past = now - chrono::Duration::seconds(120);
        registry
            .apply_heartbeat("a1", past, 0.0, AgentStatus::Online)
            .await
            .unwrap();
        let stale = registry.stale_agents(now, 90).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].agent_id, "a1");
    }
}
