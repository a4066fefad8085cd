//! In-memory inverted index from capability tag to agent id set.
//!
//! Lives inside the registry's write lock so it can never diverge from
//! the agent map. Discovery returns candidate ids only; ranking is the
//! dispatcher's job.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct CapabilityIndex {
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index slice for one agent with its current capability
    /// set. Called on every registration.
    pub fn set_agent(&mut self, agent_id: &str, capabilities: &[String]) {
        self.remove_agent(agent_id);
        for capability in capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(agent_id.to_string());
        }
    }

    pub fn remove_agent(&mut self, agent_id: &str) {
        self.by_capability.retain(|_, agents| {
            agents.remove(agent_id);
            !agents.is_empty()
        });
    }

    /// Candidate ids for a task: the union of the sets for each required
    /// capability when given, otherwise the set for the task type.
    pub fn discover(&self, task_type: &str, required: Option<&[String]>) -> BTreeSet<String> {
        match required {
            Some(caps) if !caps.is_empty() => caps
                .iter()
                .filter_map(|c| self.by_capability.get(c))
                .flatten()
                .cloned()
                .collect(),
            _ => self
                .by_capability
                .get(task_type)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// All (capability, agent_id) pairs currently indexed. Test support
    /// for the coherence property.
    #[cfg(test)]
    pub fn entries(&self) -> Vec<(String, String)> {
        self.by_capability
            .iter()
            .flat_map(|(cap, agents)| {
                agents
                    .iter()
                    .map(move |id| (cap.clone(), id.clone()))
            })
            .collect()
    }
}
