//! Policy and phase definitions.
//!
//! A policy is a named, ordered sequence of phases plus retry and timeout
//! rules. Policies are declared in `conductor.toml` under `[[policies]]`:
//!
//! ```toml
//! [[policies]]
//! name = "feature"
//! issue_types = ["feature"]
//! priority = 50
//! timeout_base_ms = 1800000
//!
//! [policies.retry]
//! max_attempts = 3
//! backoff_strategy = "exponential"
//! initial_delay_ms = 5000
//! max_delay_ms = 300000
//!
//! [[policies.phases]]
//! name = "plan"
//! capabilities = ["planning"]
//!
//! [[policies.phases]]
//! name = "implement"
//! capabilities = ["coding"]
//! timeout_multiplier = 2.0
//! reuse_session = "@previous"
//! ```

pub mod resolver;
pub mod store;

pub use resolver::{OverrideStrategy, PolicyResolver, Resolution, ResolutionSource};
pub use store::PolicyStore;

use serde::{Deserialize, Serialize};

use crate::agents::PerformanceTier;

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => write!(f, "exponential"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Fixed => write!(f, "fixed"),
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            _ => anyhow::bail!(
                "Invalid backoff strategy '{}'. Valid values: exponential, linear, fixed",
                s
            ),
        }
    }
}

/// Retry parameters for failed phase attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed per phase, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// A named workflow: ordered phases plus retry and timeout rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Base timeout for one phase attempt, scaled by the phase multiplier
    #[serde(default = "default_timeout_base_ms")]
    pub timeout_base_ms: u64,
    /// Age after which the external monitor treats a running attempt as stalled
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Issue types this policy applies to
    #[serde(default)]
    pub issue_types: Vec<String>,
    /// Higher wins when several policies match the same issue type
    #[serde(default)]
    pub priority: i32,
    /// Blocked issues always carry a HITL reason label
    #[serde(default)]
    pub require_hitl: bool,
    #[serde(default)]
    pub disable_worker_assistant: bool,
}

fn default_timeout_base_ms() -> u64 {
    30 * 60 * 1000
}

fn default_stall_threshold_ms() -> u64 {
    10 * 60 * 1000
}

impl Policy {
    /// Create a policy with default retry/timeout settings.
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            description: None,
            phases,
            retry: RetryConfig::default(),
            timeout_base_ms: default_timeout_base_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
            issue_types: Vec::new(),
            priority: 0,
            require_hitl: false,
            disable_worker_assistant: false,
        }
    }

    pub fn with_issue_types(mut self, types: &[&str]) -> Self {
        self.issue_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_base_ms(mut self, timeout_base_ms: u64) -> Self {
        self.timeout_base_ms = timeout_base_ms;
        self
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn first_phase(&self) -> Option<&Phase> {
        self.phases.first()
    }

    /// The phase following `name` in sequence order, `None` for the last phase.
    pub fn next_phase(&self, name: &str) -> Option<&Phase> {
        self.phase_index(name)
            .and_then(|idx| self.phases.get(idx + 1))
    }

    /// The phase preceding `name` in sequence order.
    pub fn previous_phase(&self, name: &str) -> Option<&Phase> {
        match self.phase_index(name) {
            Some(idx) if idx > 0 => self.phases.get(idx - 1),
            _ => None,
        }
    }

    pub fn matches_issue_type(&self, issue_type: &str) -> bool {
        self.issue_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(issue_type))
    }
}

/// Where a phase may reuse a previous execution session from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionTarget {
    /// The most recent completed run of the issue, whatever its phase
    Shared,
    /// The phase immediately before this one
    Previous,
    /// This same phase (continue a retried attempt)
    SelfPhase,
    /// The first phase of the policy
    First,
    /// An explicitly named phase
    Phase(String),
}

impl TryFrom<String> for SessionTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "@shared" => Ok(SessionTarget::Shared),
            "@previous" => Ok(SessionTarget::Previous),
            "@self" => Ok(SessionTarget::SelfPhase),
            "@first" => Ok(SessionTarget::First),
            "" => Err("session reuse target must not be empty".to_string()),
            other if other.starts_with('@') => Err(format!(
                "Unknown session reuse target '{}'. Valid values: @shared, @previous, @self, @first or a phase name",
                other
            )),
            other => Ok(SessionTarget::Phase(other.to_string())),
        }
    }
}

impl From<SessionTarget> for String {
    fn from(value: SessionTarget) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionTarget::Shared => write!(f, "@shared"),
            SessionTarget::Previous => write!(f, "@previous"),
            SessionTarget::SelfPhase => write!(f, "@self"),
            SessionTarget::First => write!(f, "@first"),
            SessionTarget::Phase(name) => write!(f, "{}", name),
        }
    }
}

/// Which outcome of a phase hands routing over to the decision agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionTrigger {
    #[default]
    Success,
    Failure,
    Always,
}

impl DecisionTrigger {
    pub fn fires_on(&self, success: bool) -> bool {
        match self {
            DecisionTrigger::Success => success,
            DecisionTrigger::Failure => !success,
            DecisionTrigger::Always => true,
        }
    }
}

/// Confidence thresholds applied to decision agent replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    /// Replies below this confidence escalate to a human
    #[serde(default = "default_require_approval_threshold")]
    pub require_approval: f64,
}

fn default_require_approval_threshold() -> f64 {
    0.6
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            require_approval: default_require_approval_threshold(),
        }
    }
}

/// Per-phase decision agent routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Capability the decision agent must provide
    #[serde(default = "default_decision_capability")]
    pub capability: String,
    /// Phases the agent may route to; empty means any phase of the policy
    #[serde(default)]
    pub allowed_destinations: Vec<String>,
    #[serde(default)]
    pub thresholds: ConfidenceThresholds,
    /// Key into `[templates]`; the built-in template is used when absent
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub trigger: DecisionTrigger,
    /// Extra prompts after an invalid reply before degrading to block
    #[serde(default = "default_max_reprompts")]
    pub max_reprompts: u32,
    #[serde(default = "default_decision_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_decision_capability() -> String {
    "decision".to_string()
}

fn default_max_reprompts() -> u32 {
    2
}

fn default_decision_timeout_secs() -> u64 {
    300
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            capability: default_decision_capability(),
            allowed_destinations: Vec::new(),
            thresholds: ConfidenceThresholds::default(),
            prompt_template: None,
            trigger: DecisionTrigger::default(),
            max_reprompts: default_max_reprompts(),
            timeout_secs: default_decision_timeout_secs(),
        }
    }
}

impl DecisionConfig {
    pub fn with_destinations(mut self, destinations: &[&str]) -> Self {
        self.allowed_destinations = destinations.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_require_approval_threshold(mut self, threshold: f64) -> Self {
        self.thresholds.require_approval = threshold;
        self
    }

    pub fn with_trigger(mut self, trigger: DecisionTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Destinations allowed within `policy`, expanding an empty list to every phase.
    pub fn destinations<'a>(&'a self, policy: &'a Policy) -> Vec<&'a str> {
        if self.allowed_destinations.is_empty() {
            policy.phases.iter().map(|p| p.name.as_str()).collect()
        } else {
            self.allowed_destinations.iter().map(String::as_str).collect()
        }
    }
}

/// Agent constraints a phase places on selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConstraints {
    /// Every listed tag must be carried by the agent
    #[serde(default)]
    pub tags: Vec<String>,
    /// When set, the agent's read-only flag must match
    #[serde(default)]
    pub read_only: Option<bool>,
    /// Minimum performance tier
    #[serde(default)]
    pub performance_tier: Option<PerformanceTier>,
}

/// One named step of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Pin execution to one agent id
    #[serde(default)]
    pub agent: Option<String>,
    /// Model override, wins over the agent's own model
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub reuse_session: Option<SessionTarget>,
    /// Custom instructions template with `{{placeholder}}` variables
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub decision: Option<DecisionConfig>,
    #[serde(default)]
    pub disable_worker_assistant: bool,
    #[serde(default)]
    pub constraints: AgentConstraints,
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            agent: None,
            model: None,
            timeout_multiplier: default_timeout_multiplier(),
            require_approval: false,
            reuse_session: None,
            prompt_template: None,
            decision: None,
            disable_worker_assistant: false,
            constraints: AgentConstraints::default(),
        }
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_session_reuse(mut self, target: SessionTarget) -> Self {
        self.reuse_session = Some(target);
        self
    }

    pub fn with_decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }
}
