//! Request decoding and semantic validation.
//!
//! The HTTP surface accepts raw JSON and binds it to the card/task record
//! types here, so schema violations surface in the protocol envelope
//! rather than as framework rejections.

use crate::{
    models::{AgentCardRequest, TaskRequest},
    HubError, Result,
};
use serde_json::Value;
use url::Url;

/// Protocol name every registered agent must support.
const REQUIRED_PROTOCOL: &str = "a2a";

/// Bind a registration body to an [`AgentCardRequest`] and enforce the
/// card invariants: non-empty identity fields, at least one capability,
/// the `a2a` protocol, and well-formed endpoint URLs. Capability and
/// protocol lists are deduplicated, preserving first occurrence.
pub fn parse_agent_card(body: Value) -> Result<AgentCardRequest> {
    let mut card: AgentCardRequest = serde_json::from_value(body)
        .map_err(|e| HubError::Validation(format!("invalid agent card: {e}")))?;

    if card.agent_id.trim().is_empty() {
        return Err(HubError::Validation("agent_id must not be empty".into()));
    }
    if card.name.trim().is_empty() {
        return Err(HubError::Validation("name must not be empty".into()));
    }
    if card.version.trim().is_empty() {
        return Err(HubError::Validation("version must not be empty".into()));
    }

    card.capabilities = dedup(card.capabilities);
    card.protocols = dedup(card.protocols);

    if card.capabilities.is_empty() {
        return Err(HubError::Validation(
            "capabilities must contain at least one entry".into(),
        ));
    }
    if card.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(HubError::Validation(
            "capabilities must not contain empty tags".into(),
        ));
    }
    if !card.protocols.iter().any(|p| p == REQUIRED_PROTOCOL) {
        return Err(HubError::Validation(format!(
            "protocols must include {REQUIRED_PROTOCOL:?}"
        )));
    }

    check_url("endpoints.a2a", &card.endpoints.a2a)?;
    check_url("endpoints.health", &card.endpoints.health)?;

    Ok(card)
}

/// Bind a delegation body to a [`TaskRequest`] and enforce the task
/// invariants: non-empty type and requester, object payload, priority in
/// [1, 10], positive timeout.
pub fn parse_task_request(body: Value) -> Result<TaskRequest> {
    let mut req: TaskRequest = serde_json::from_value(body)
        .map_err(|e| HubError::Validation(format!("invalid task request: {e}")))?;

    if req.task_type.trim().is_empty() {
        return Err(HubError::Validation("task_type must not be empty".into()));
    }
    if req.requester_id.trim().is_empty() {
        return Err(HubError::Validation(
            "requester_id must not be empty".into(),
        ));
    }
    if !req.payload.is_object() {
        return Err(HubError::Validation("payload must be an object".into()));
    }
    if let Some(id) = &req.task_id {
        if id.trim().is_empty() {
            return Err(HubError::Validation(
                "task_id must not be empty when provided".into(),
            ));
        }
    }
    if !(1..=10).contains(&req.priority) {
        return Err(HubError::Validation(
            "priority must be between 1 and 10".into(),
        ));
    }
    if req.timeout <= 0 {
        return Err(HubError::Validation("timeout must be positive".into()));
    }

    req.required_capabilities = dedup(req.required_capabilities);

    Ok(req)
}

fn check_url(field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| HubError::Validation(format!("{field} is not a valid URL: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(HubError::Validation(format!(
            "{field} must be an http(s) URL"
        )));
    }
    Ok(())
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
