//! Agent capability registry.
//!
//! Agents are declared in `conductor.toml`:
//!
//! ```toml
//! [[agents]]
//! id = "claude-coder"
//! capabilities = ["planning", "coding"]
//! model = "claude-sonnet-4-5"
//! priority = 10
//! tags = ["rust"]
//! performance_tier = "high"
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::policy::AgentConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    #[default]
    Standard,
    High,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceTier::Low => write!(f, "low"),
            PerformanceTier::Standard => write!(f, "standard"),
            PerformanceTier::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Higher is preferred
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub performance_tier: PerformanceTier,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            model: None,
            priority: 0,
            status: AgentStatus::Active,
            tags: Vec::new(),
            read_only: false,
            performance_tier: PerformanceTier::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = AgentStatus::Inactive;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.capabilities.contains(r))
    }

    pub fn satisfies(&self, constraints: &AgentConstraints) -> bool {
        if !constraints.tags.iter().all(|t| self.tags.contains(t)) {
            return false;
        }
        if let Some(read_only) = constraints.read_only
            && read_only != self.read_only
        {
            return false;
        }
        if let Some(tier) = constraints.performance_tier
            && self.performance_tier < tier
        {
            return false;
        }
        true
    }
}

/// What a phase asks of the agent that will run it.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub capabilities: Vec<String>,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub constraints: AgentConstraints,
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Agents holding every capability in `caps`.
    async fn find_by_capabilities(&self, caps: &[String], active_only: bool) -> Result<Vec<AgentProfile>>;

    /// Best agent for `criteria`, or `None` when nobody qualifies.
    async fn select_agent(&self, criteria: &SelectionCriteria) -> Result<Option<AgentProfile>>;
}

/// Registry over a fixed agent list from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    agents: Vec<AgentProfile>,
}

impl StaticRegistry {
    pub fn new(agents: Vec<AgentProfile>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    /// Selection is a pure filter-then-rank over the agent list.
    pub fn select(&self, criteria: &SelectionCriteria) -> Option<&AgentProfile> {
        self.agents
            .iter()
            .filter(|a| a.has_capabilities(&criteria.capabilities))
            .filter(|a| criteria.agent_id.as_ref().is_none_or(|id| &a.id == id))
            .filter(|a| {
                // A pinned model only rules out agents locked to a different model.
                match (&criteria.model, &a.model) {
                    (Some(wanted), Some(own)) => wanted == own || criteria.agent_id.is_some(),
                    _ => true,
                }
            })
            .filter(|a| a.is_active())
            .filter(|a| a.satisfies(&criteria.constraints))
            // max_by_key returns the last maximum; reverse keeps the first-declared agent on ties.
            .rev()
            .max_by_key(|a| a.priority)
    }
}

#[async_trait]
impl AgentRegistry for StaticRegistry {
    async fn find_by_capabilities(&self, caps: &[String], active_only: bool) -> Result<Vec<AgentProfile>> {
        Ok(self
            .agents
            .iter()
            .filter(|a| a.has_capabilities(caps))
            .filter(|a| !active_only || a.is_active())
            .cloned()
            .collect())
    }

    async fn select_agent(&self, criteria: &SelectionCriteria) -> Result<Option<AgentProfile>> {
        Ok(self.select(criteria).cloned())
    }
}
