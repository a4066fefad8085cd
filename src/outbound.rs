//! Outbound HTTP to registered agents: health probes and delegation.

use crate::{config::HubConfig, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Shared client for the hub's calls to agent endpoints.
///
/// Each call carries its own deadline: short for health probes, longer for
/// delegation POSTs that may block on agent-side intake.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    delegation_timeout: Duration,
}

impl AgentClient {
    pub fn new(config: &HubConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            delegation_timeout: Duration::from_secs(config.delegation_timeout_secs),
        })
    }

    /// GET the agent's health endpoint. Any 2xx within the probe deadline
    /// counts as healthy.
    pub async fn health_check(&self, health_url: &str) -> bool {
        match self
            .http
            .get(health_url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health probe failed for {health_url}: {e}");
                false
            }
        }
    }

    /// POST a delegation payload to the agent's a2a endpoint.
    ///
    /// Transport failures and non-2xx statuses both surface as the error
    /// text recorded on the failed task.
    pub async fn delegate(
        &self,
        a2a_url: &str,
        payload: &Value,
    ) -> std::result::Result<(), String> {
        match self
            .http
            .post(a2a_url)
            .timeout(self.delegation_timeout)
            .json(payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(format!("agent returned {status}: {body}"))
            }
            Err(e) => Err(format!("delegation request failed: {e}")),
        }
    }
}
