//! Typed error hierarchy for the conductor engine.
//!
//! - `ConfigError`: policy store and `conductor.toml` validation failures (fail fast at load)
//! - `ResolveError`: policy resolution failures for a single issue
//! - `DispatchError`: agent platform transport failures, converted to failed outcomes
//! - `TrackerError`: issue tracker collaborator failures

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No policies configured")]
    NoPolicies,

    #[error("Duplicate policy name '{name}'")]
    DuplicatePolicy { name: String },

    #[error("Policy '{policy}' has no phases")]
    EmptyPhases { policy: String },

    #[error("Policy '{policy}' declares phase '{phase}' more than once")]
    DuplicatePhase { policy: String, phase: String },

    #[error("Default policy '{name}' is not defined")]
    UnknownDefaultPolicy { name: String },

    #[error("Policy '{policy}' phase '{phase}' references unknown phase '{target}'")]
    UnknownPhaseReference {
        policy: String,
        phase: String,
        target: String,
    },

    #[error("Policy '{policy}' phase '{phase}' references unknown prompt template '{key}'")]
    UnknownTemplate {
        policy: String,
        phase: String,
        key: String,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid HITL reason pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
}

/// Errors from resolving an issue to a policy.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Issue {issue} requests unknown workflow '{policy}'")]
    UnknownWorkflowOverride { issue: String, policy: String },

    #[error("Policy '{policy}' is not defined")]
    UnknownPolicy { policy: String },
}

/// Errors from the agent execution platform.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent {agent} is not registered with the platform")]
    UnknownAgent { agent: String },

    #[error("Agent call timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    /// Short machine-readable tag recorded as the outcome error type.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::SpawnFailed { .. } => "spawn_failed",
            DispatchError::Io(_) => "transport",
            DispatchError::UnknownAgent { .. } => "unknown_agent",
            DispatchError::TimedOut { .. } => "timeout",
            DispatchError::Other(_) => "transport",
        }
    }
}

/// Errors from the issue tracker collaborator.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Issue {id} not found")]
    IssueNotFound { id: String },

    #[error("Tracker command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to parse tracker output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
