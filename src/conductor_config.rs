//! `.conductor/conductor.toml`: the whole engine configuration.
//!
//! ```toml
//! default_policy = "feature"
//!
//! [worker]
//! poll_interval_secs = 30
//! max_issues_per_cycle = 10
//! default_model = "sonnet"
//!
//! [labels]
//! prefix = "conductor"
//! override_strategy = "error"     # error | warning | ignore
//! hitl_pattern = "^custom-[a-z-]+$"
//!
//! [worker_assistant]
//! enabled = true
//! fallback_action = "block"
//!
//! [session]
//! threshold = 0.8
//! max_context_tokens = 130000
//!
//! [tracker]
//! kind = "beads"                  # beads | memory
//! bin = "bd"
//!
//! [platform]
//! claude_cmd = "claude"
//!
//! [[agents]]
//! id = "coder"
//! capabilities = ["coding"]
//! priority = 10
//!
//! [[policies]]
//! name = "feature"
//! issue_types = ["feature"]
//!
//! [[policies.phases]]
//! name = "implement"
//! capabilities = ["coding"]
//!
//! [templates]
//! router = "Route issue {{issue_id}} ..."
//! ```
//!
//! Structural problems fail the load with a [`ConfigError`]; softer
//! problems are returned as warnings by [`ConductorToml::validate`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::agents::{AgentProfile, SelectionCriteria, StaticRegistry};
use crate::decision::WorkerAssistantConfig;
use crate::errors::ConfigError;
use crate::policy::{OverrideStrategy, Policy, PolicyResolver, PolicyStore};
use crate::session::SessionConfig;
use crate::tracker::labels::default_hitl_reasons;
use crate::tracker::{HitlPolicy, LabelConventions};
use crate::worker::WorkerConfig;

pub const CONFIG_FILE: &str = "conductor.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Working directory for agent processes, relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsSection {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Allowed `<prefix>-hitl:<reason>` values
    #[serde(default = "default_hitl_reasons")]
    pub hitl_reasons: Vec<String>,
    /// Extra reasons matching this regex are also allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_pattern: Option<String>,
    #[serde(default)]
    pub override_strategy: OverrideStrategy,
}

fn default_prefix() -> String {
    "conductor".to_string()
}

impl Default for LabelsSection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            hitl_reasons: default_hitl_reasons(),
            hitl_pattern: None,
            override_strategy: OverrideStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    /// The `bd` command line tracker
    #[default]
    Beads,
    /// Process-local, for dry runs
    Memory,
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerKind::Beads => write!(f, "beads"),
            TrackerKind::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for TrackerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "beads" | "bd" => Ok(TrackerKind::Beads),
            "memory" => Ok(TrackerKind::Memory),
            _ => anyhow::bail!("Unknown tracker kind: '{}'. Valid values: beads, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default)]
    pub kind: TrackerKind,
    #[serde(default = "default_tracker_bin")]
    pub bin: String,
}

fn default_tracker_bin() -> String {
    "bd".to_string()
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            kind: TrackerKind::default(),
            bin: default_tracker_bin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
}

fn default_skip_permissions() -> bool {
    true
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            skip_permissions: default_skip_permissions(),
        }
    }
}

/// The complete `conductor.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    /// Falls back to the first declared policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<String>,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub labels: LabelsSection,
    #[serde(default)]
    pub worker_assistant: WorkerAssistantConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub platform: PlatformSection,
    /// Named prompt templates referenced by phases and decision configs
    #[serde(default)]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `<dir>/conductor.toml`, or defaults when it does not exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self, ConfigError> {
        let path = conductor_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command (file, then `CLAUDE_CMD`, then `claude`).
    pub fn claude_cmd(&self) -> String {
        self.platform
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// `SKIP_PERMISSIONS` overrides the file setting.
    pub fn skip_permissions(&self) -> bool {
        if let Ok(env_val) = std::env::var("SKIP_PERMISSIONS") {
            return env_val != "false";
        }
        self.platform.skip_permissions
    }

    pub fn default_policy_name(&self) -> Option<&str> {
        self.default_policy
            .as_deref()
            .or_else(|| self.policies.first().map(|p| p.name.as_str()))
    }

    pub fn label_conventions(&self) -> LabelConventions {
        LabelConventions::new(self.labels.prefix.clone())
    }

    pub fn resolver(&self) -> PolicyResolver {
        PolicyResolver::new(self.label_conventions(), self.labels.override_strategy)
    }

    pub fn hitl_policy(&self) -> Result<HitlPolicy, ConfigError> {
        HitlPolicy::new(self.labels.hitl_reasons.clone(), self.labels.hitl_pattern.as_deref())
    }

    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::new(self.agents.clone())
    }

    /// Validated policy store. Decision template keys must exist in `[templates]`.
    pub fn build_store(&self) -> Result<PolicyStore, ConfigError> {
        for policy in &self.policies {
            for phase in &policy.phases {
                if let Some(key) = phase.decision.as_ref().and_then(|d| d.prompt_template.as_ref())
                    && !self.templates.contains_key(key)
                {
                    return Err(ConfigError::UnknownTemplate {
                        policy: policy.name.clone(),
                        phase: phase.name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        let default = self.default_policy_name().ok_or(ConfigError::NoPolicies)?;
        PolicyStore::new(self.policies.clone(), default)
    }

    /// Fail on structural errors, otherwise return warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.labels.prefix.trim().is_empty() || self.labels.prefix.contains(char::is_whitespace) {
            return Err(invalid("labels.prefix", "must be a non-empty word"));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(invalid("worker.poll_interval_secs", "must be at least 1"));
        }
        if self.worker.max_issues_per_cycle == 0 {
            return Err(invalid("worker.max_issues_per_cycle", "must be at least 1"));
        }
        if !(self.session.threshold > 0.0 && self.session.threshold <= 1.0) {
            return Err(invalid("session.threshold", "must be in (0, 1]"));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(invalid("agents", &format!("duplicate agent id '{}'", agent.id)));
            }
        }
        self.hitl_policy()?;
        self.build_store()?;

        let mut warnings = Vec::new();
        let registry = self.registry();

        if self.worker.max_concurrent_runs > 1 {
            warnings.push(format!(
                "worker.max_concurrent_runs = {} is not enforced; runs are dispatched one at a time",
                self.worker.max_concurrent_runs
            ));
        }
        if self.tracker.kind == TrackerKind::Memory {
            warnings.push("tracker.kind = \"memory\" keeps issues in process memory only".to_string());
        }

        for policy in &self.policies {
            if policy.issue_types.is_empty() && Some(policy.name.as_str()) != self.default_policy_name() {
                warnings.push(format!(
                    "Policy '{}' has no issue_types and is not the default; only override labels select it",
                    policy.name
                ));
            }
            for phase in &policy.phases {
                let criteria = SelectionCriteria {
                    capabilities: phase.capabilities.clone(),
                    agent_id: phase.agent.clone(),
                    model: phase.model.clone(),
                    constraints: phase.constraints.clone(),
                };
                if registry.select(&criteria).is_none() {
                    warnings.push(format!(
                        "No active agent can run phase '{}' of policy '{}'",
                        phase.name, policy.name
                    ));
                }
                if let Some(decision) = &phase.decision
                    && !self.has_capability(&decision.capability)
                {
                    warnings.push(format!(
                        "No active agent has decision capability '{}' (policy '{}', phase '{}'); decisions will block",
                        decision.capability, policy.name, phase.name
                    ));
                }
            }
        }

        if self.worker_assistant.enabled && !self.has_capability(&self.worker_assistant.capability) {
            warnings.push(format!(
                "Worker assistant is enabled but no active agent has capability '{}'; fallback '{}' applies",
                self.worker_assistant.capability, self.worker_assistant.fallback_action
            ));
        }

        Ok(warnings)
    }

    fn has_capability(&self, capability: &str) -> bool {
        self.agents
            .iter()
            .any(|a| a.is_active() && a.capabilities.iter().any(|c| c == capability))
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Starter configuration written by `conductor init`.
pub const DEFAULT_CONFIG: &str = r#"# Conductor configuration
default_policy = "feature"

[worker]
poll_interval_secs = 30
max_issues_per_cycle = 10

[labels]
prefix = "conductor"
override_strategy = "error"

[worker_assistant]
enabled = true
fallback_action = "block"

[session]
threshold = 0.8
max_context_tokens = 130000

[tracker]
kind = "beads"
bin = "bd"

[platform]
skip_permissions = true

[[agents]]
id = "planner"
capabilities = ["planning"]
priority = 10

[[agents]]
id = "coder"
capabilities = ["coding", "testing"]
priority = 10

[[agents]]
id = "reviewer"
capabilities = ["review", "worker-assistant", "decision"]
priority = 5

[[policies]]
name = "feature"
description = "Plan, build, test and review new functionality"
issue_types = ["feature", "task"]
priority = 10

[policies.retry]
max_attempts = 3
backoff_strategy = "exponential"
initial_delay_ms = 5000
max_delay_ms = 300000

[[policies.phases]]
name = "plan"
capabilities = ["planning"]

[[policies.phases]]
name = "implement"
capabilities = ["coding"]
reuse_session = "@previous"
timeout_multiplier = 2.0

[[policies.phases]]
name = "test"
capabilities = ["testing"]

[[policies.phases]]
name = "review"
capabilities = ["review"]

[policies.phases.decision]
capability = "decision"
allowed_destinations = ["implement", "test"]
trigger = "always"

[policies.phases.decision.thresholds]
require_approval = 0.6

[[policies]]
name = "bugfix"
description = "Reproduce, fix and verify a bug"
issue_types = ["bug"]
priority = 10

[[policies.phases]]
name = "implement"
capabilities = ["coding"]

[[policies.phases]]
name = "test"
capabilities = ["testing"]
reuse_session = "@previous"

[[policies]]
name = "hotfix"
description = "Urgent fix that needs a human sign-off"
issue_types = ["incident"]
priority = 20
require_hitl = true

[[policies.phases]]
name = "implement"
capabilities = ["coding"]
require_approval = true
"#;
