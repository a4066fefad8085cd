use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Runtime configuration for the hub.
///
/// Everything is optional with sane defaults; the protocol is trust-based
/// inside a controlled network so there are no required secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    /// Deadline for health probes, seconds.
    pub probe_timeout_secs: u64,
    /// Deadline for outbound delegation POSTs, seconds.
    pub delegation_timeout_secs: u64,
    /// Maximum heartbeat age before an agent is re-probed, seconds.
    pub liveness_window_secs: u64,
    /// Cadence of the background liveness probe loop, seconds.
    pub probe_interval_secs: u64,
    /// Cadence of the task timeout sweeper, seconds.
    pub sweep_interval_secs: u64,
    /// How long finalized tasks stay in the active map before eviction.
    pub task_retention_secs: u64,
    /// Allowed CORS origins; empty means any (trusted network).
    pub allowed_origins: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl HubConfig {
    /// Load configuration from the environment, reading a `.env` file
    /// first when one is present. Malformed values fall back to defaults.
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("no .env file found"),
        }

        let allowed_origins = env::var("HUB_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            host: env::var("HUB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("HUB_PORT", 8200),
            database_path: env::var("HUB_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/a2a_hub.db")),
            probe_timeout_secs: env_parse("HUB_PROBE_TIMEOUT_SECS", 5),
            delegation_timeout_secs: env_parse("HUB_DELEGATION_TIMEOUT_SECS", 30),
            liveness_window_secs: env_parse("HUB_LIVENESS_WINDOW_SECS", 90),
            probe_interval_secs: env_parse("HUB_PROBE_INTERVAL_SECS", 30),
            sweep_interval_secs: env_parse("HUB_SWEEP_INTERVAL_SECS", 5),
            task_retention_secs: env_parse("HUB_TASK_RETENTION_SECS", 3600),
            allowed_origins,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8200,
            database_path: PathBuf::from("data/a2a_hub.db"),
            probe_timeout_secs: 5,
            delegation_timeout_secs: 30,
            liveness_window_secs: 90,
            probe_interval_secs: 30,
            sweep_interval_secs: 5,
            task_retention_secs: 3600,
            allowed_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_cadence() {
        let config = HubConfig::default();
        // Liveness window is three times the nominal 30s heartbeat cadence.
        assert_eq!(config.liveness_window_secs, 90);
        assert_eq!(config.probe_timeout_secs, 5);
        assert_eq!(config.delegation_timeout_secs, 30);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("HUB_TEST_GARBAGE_PORT", "not-a-number");
        let port: u16 = env_parse("HUB_TEST_GARBAGE_PORT", 8200);
        assert_eq!(port, 8200);
        std::env::remove_var("HUB_TEST_GARBAGE_PORT");
    }
}
