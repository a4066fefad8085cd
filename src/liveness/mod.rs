//! Liveness tracking: heartbeat intake and the background probe loop.
//!
//! Agents report load over heartbeats at a nominal 30s cadence. Agents
//! that go quiet for longer than the liveness window get a health probe;
//! probe failure flips them OFFLINE. An OFFLINE agent only returns to
//! ONLINE after a successful probe, never on the strength of a heartbeat
//! alone.

use crate::{
    config::HubConfig,
    models::{clamp_load, AgentStatus},
    outbound::AgentClient,
    registry::AgentRegistry,
    HubError, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Load score at and above which an agent is marked advisory-busy.
pub const BUSY_LOAD_THRESHOLD: f64 = 0.95;

pub struct LivenessTracker {
    registry: Arc<AgentRegistry>,
    client: Arc<AgentClient>,
    liveness_window_secs: u64,
    probe_interval_secs: u64,
}

impl LivenessTracker {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<AgentClient>,
        config: &HubConfig,
    ) -> Self {
        Self {
            registry,
            client,
            liveness_window_secs: config.liveness_window_secs,
            probe_interval_secs: config.probe_interval_secs,
        }
    }

    /// Handle one heartbeat: clamp and record the reported load, stamp
    /// the heartbeat, and derive the resulting status. Returns the status
    /// the agent ended up in.
    pub async fn record_heartbeat(&self, agent_id: &str, load_score: f64) -> Result<AgentStatus> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;

        let load = clamp_load(load_score);
        let status = if agent.status == AgentStatus::Offline {
            // Re-entry requires a successful probe, not just a heartbeat.
            if self.client.health_check(&agent.endpoints.health).await {
                info!("agent {agent_id} back online after heartbeat probe");
                AgentStatus::Online
            } else {
                AgentStatus::Offline
            }
        } else if load >= BUSY_LOAD_THRESHOLD {
            AgentStatus::Busy
        } else {
            AgentStatus::Online
        };

        self.registry
            .apply_heartbeat(agent_id, Utc::now(), load, status)
            .await?;
        Ok(status)
    }

    /// Probe every agent whose heartbeat is older than the liveness
    /// window. Probe success refreshes the heartbeat and restores ONLINE;
    /// failure flips the agent OFFLINE. Returns how many agents were
    /// probed.
    pub async fn probe_cycle(&self, now: DateTime<Utc>) -> usize {
        let stale = self
            .registry
            .stale_agents(now, self.liveness_window_secs)
            .await;
        let probed = stale.len();

        for agent in stale {
            if self.client.health_check(&agent.endpoints.health).await {
                debug!("stale agent {} answered its probe", agent.agent_id);
                if let Err(e) = self
                    .registry
                    .apply_heartbeat(
                        &agent.agent_id,
                        Utc::now(),
                        agent.load_score,
                        AgentStatus::Online,
                    )
                    .await
                {
                    warn!("could not refresh agent {}: {e}", agent.agent_id);
                }
            } else if agent.status != AgentStatus::Offline {
                warn!("agent {} failed its liveness probe, marking offline", agent.agent_id);
                if let Err(e) = self
                    .registry
                    .mark_status(&agent.agent_id, AgentStatus::Offline)
                    .await
                {
                    warn!("could not mark agent {} offline: {e}", agent.agent_id);
                }
            }
        }
        probed
    }

    /// Background probe loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.probe_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("liveness prober stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_cycle(Utc::now()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentCardRequest, AgentEndpoints};
    use crate::store::Store;

    struct LivenessHarness {
        _dir: tempfile::TempDir,
        registry: Arc<AgentRegistry>,
        tracker: LivenessTracker,
    }

    async fn harness() -> LivenessHarness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::connect(&dir.path().join("hub.db")).await.unwrap());
        let config = HubConfig {
            probe_timeout_secs: 2,
            liveness_window_secs: 90,
            ..HubConfig::default()
        };
        let client = Arc::new(AgentClient::new(&config).unwrap());
        let registry = Arc::new(
            AgentRegistry::new(store, client.clone()).await.unwrap(),
        );
        let tracker = LivenessTracker::new(registry.clone(), client, &config);
        LivenessHarness {
            _dir: dir,
            registry,
            tracker,
        }
    }

    async fn register_worker(registry: &AgentRegistry, agent_id: &str) -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;
        registry
            .register(AgentCardRequest {
                agent_id: agent_id.to_string(),
                name: format!("{agent_id} worker"),
                version: "1.0.0".to_string(),
                capabilities: vec!["summary".to_string()],
                protocols: vec!["a2a".to_string()],
                endpoints: AgentEndpoints {
                    a2a: format!("{}/a2a", server.url()),
                    health: format!("{}/health", server.url()),
                    extra: Default::default(),
                },
                metadata: None,
            })
            .await
            .unwrap();
        server
    }

    #[tokio::test]
    async fn heartbeat_records_load_and_stamp() {
        let h = harness().await;
        let _worker = register_worker(&h.registry, "a1").await;

        let before = h.registry.get("a1").await.unwrap().last_heartbeat;
        let status = h.tracker.record_heartbeat("a1", 0.5).await.unwrap();
        assert_eq!(status, AgentStatus::Online);

        let card = h.registry.get("a1").await.unwrap();
        assert_eq!(card.load_score, 0.5);
        assert!(card.last_heartbeat >= before);
    }

    #[tokio::test]
    async fn heartbeat_clamps_load() {
        let h = harness().await;
        let _worker = register_worker(&h.registry, "a1").await;

        h.tracker.record_heartbeat("a1", 17.0).await.unwrap();
        assert_eq!(h.registry.get("a1").await.unwrap().load_score, 1.0);
    }

    #[tokio::test]
    async fn saturated_heartbeat_marks_busy() {
        let h = harness().await;
        let _worker = register_worker(&h.registry, "a1").await;

        let status = h.tracker.record_heartbeat("a1", 0.97).await.unwrap();
        assert_eq!(status, AgentStatus::Busy);

        let status = h.tracker.record_heartbeat("a1", 0.2).await.unwrap();
        assert_eq!(status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_agent_is_not_found() {
        let h = harness().await;
        assert!(matches!(
            h.tracker.record_heartbeat("ghost", 0.1).await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn offline_agent_needs_probe_to_return() {
        let h = harness().await;
        let mut worker = register_worker(&h.registry, "a1").await;
        h.registry
            .mark_status("a1", AgentStatus::Offline)
            .await
            .unwrap();

        // Health endpoint gone: heartbeat alone must not revive it.
        worker.reset_async().await;
        let status = h.tracker.record_heartbeat("a1", 0.1).await.unwrap();
        assert_eq!(status, AgentStatus::Offline);

        // Health endpoint back: heartbeat-triggered probe revives it.
        worker
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let status = h.tracker.record_heartbeat("a1", 0.1).await.unwrap();
        assert_eq!(status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn probe_cycle_flips_silent_agents_offline_and_back() {
        let h = harness().await;
        let mut worker = register_worker(&h.registry, "a1").await;

        // Go quiet past the liveness window, with a dead health endpoint.
        let past = Utc::now() - chrono::Duration::seconds(120);
        h.registry
            .apply_heartbeat("a1", past, 0.3, AgentStatus::Online)
            .await
            .unwrap();
        worker.reset_async().await;

        let probed = h.tracker.probe_cycle(Utc::now()).await;
        assert_eq!(probed, 1);
        assert_eq!(
            h.registry.get("a1").await.unwrap().status,
            AgentStatus::Offline
        );

        // The endpoint comes back; the next cycle restores the agent.
        worker
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        h.tracker.probe_cycle(Utc::now()).await;

        let card = h.registry.get("a1").await.unwrap();
        assert_eq!(card.status, AgentStatus::Online);
        assert!(card.last_heartbeat > past);
    }

    #[tokio::test]
    async fn fresh_agents_are_not_probed() {
        let h = harness().await;
        let _worker = register_worker(&h.registry, "a1").await;
        assert_eq!(h.tracker.probe_cycle(Utc::now()).await, 0);
    }
}
