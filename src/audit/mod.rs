//! Run and decision audit records.
//!
//! A [`Run`] is one attempt of one agent at one phase of one issue. It is
//! created as `pending` at dispatch time and updated exactly once to a
//! terminal status. A [`DecisionRecord`] is written at every decision point
//! of the worker loop. Both are append-only.

pub mod logger;

pub use logger::{JsonlRunLog, MemoryRunLog, RunLog};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Blocked)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// 1-based attempt number: prior failed runs of the phase plus one
    pub attempt: u32,
    pub retry_count: u32,
    /// Duration of this attempt plus the failed attempts before it
    pub cumulative_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Session the attempt resumed, when continuation was allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub issue_id: String,
    pub agent_id: String,
    pub policy: String,
    pub phase: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub metadata: RunMetadata,
}

impl Run {
    pub fn new(issue_id: &str, agent_id: &str, policy: &str, phase: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            issue_id: issue_id.to_string(),
            agent_id: agent_id.to_string(),
            policy: policy.to_string(),
            phase: phase.to_string(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            outcome: None,
            metadata: RunMetadata::default(),
        }
    }

    /// Move to a terminal status with the final outcome.
    pub fn finish(&mut self, status: RunStatus, outcome: Outcome) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.metadata.session_id = outcome.session_id.clone();
        if outcome.metrics.model.is_some() {
            self.metadata.model = outcome.metrics.model.clone();
        }
        self.outcome = Some(outcome);
    }

    pub fn tokens_used(&self) -> u64 {
        self.outcome
            .as_ref()
            .map(|o| o.metrics.tokens.total())
            .unwrap_or(0)
    }

    pub fn duration_ms(&self) -> u64 {
        self.outcome
            .as_ref()
            .map(|o| o.metrics.duration_ms)
            .unwrap_or(0)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    PolicyResolution,
    AgentSelection,
    PhaseTransition,
    Retry,
    Hitl,
    Timeout,
    DynamicDecision,
    WorkerAssistant,
    SessionContinuation,
    MessageSend,
    MessageReceipt,
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionType::PolicyResolution => "policy_resolution",
            DecisionType::AgentSelection => "agent_selection",
            DecisionType::PhaseTransition => "phase_transition",
            DecisionType::Retry => "retry",
            DecisionType::Hitl => "hitl",
            DecisionType::Timeout => "timeout",
            DecisionType::DynamicDecision => "dynamic_decision",
            DecisionType::WorkerAssistant => "worker_assistant",
            DecisionType::SessionContinuation => "session_continuation",
            DecisionType::MessageSend => "message_send",
            DecisionType::MessageReceipt => "message_receipt",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    /// Absent for decisions taken before a run exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub issue_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    pub decision: String,
    pub reasoning: String,
    #[serde(default)]
    pub metadata: Value,
}

impl DecisionRecord {
    pub fn new(
        issue_id: &str,
        decision_type: DecisionType,
        decision: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: None,
            issue_id: issue_id.to_string(),
            timestamp: Utc::now(),
            decision_type,
            decision: decision.into(),
            reasoning: reasoning.into(),
            metadata: Value::Null,
        }
    }

    pub fn for_run(mut self, run_id: Option<&str>) -> Self {
        self.run_id = run_id.map(str::to_string);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
