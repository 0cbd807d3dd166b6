//! Decision subsystem: the two AI escalation paths.
//!
//! - [`assistant`]: the Worker Assistant resolves ambiguous outcomes into
//!   ADVANCE/RETRY/BLOCK, overriding the engine's base transition
//! - [`agent`]: the Decision Agent resolves a `dynamic_decision` transition
//!   into a concrete, validated, confidence-gated route
//!
//! Both degrade to `block` when their agent is unavailable or misbehaves.

pub mod agent;
pub mod assistant;

pub use agent::{DecisionAgent, DecisionReply, DecisionVerdict, Route};
pub use assistant::{AssistantDirective, AssistantVerdict, WorkerAssistant, WorkerAssistantConfig};

use std::time::Duration;
use thiserror::Error;

use crate::agents::{AgentProfile, AgentRegistry, SelectionCriteria};
use crate::audit::Run;
use crate::errors::DispatchError;
use crate::executor::{AgentPlatform, DispatchRequest};
use crate::outcome::Outcome;
use crate::policy::{Phase, Policy};
use crate::tracker::Issue;

/// Everything an escalation prompt may draw on.
#[derive(Debug, Clone, Copy)]
pub struct EscalationContext<'a> {
    pub issue: &'a Issue,
    pub policy: &'a Policy,
    pub phase: &'a Phase,
    pub outcome: &'a Outcome,
    pub retry_count: u32,
    /// The issue's earlier runs, oldest first
    pub history: &'a [Run],
}

/// Why an escalation call produced no usable reply.
#[derive(Debug, Error)]
pub(crate) enum CallFailure {
    #[error("no agent available")]
    NoAgent,
    #[error("agent registry error: {0}")]
    Registry(anyhow::Error),
    #[error(transparent)]
    Dispatch(DispatchError),
    #[error("agent run failed: {0}")]
    AgentFailed(String),
}

/// Pick the agent holding `capability`.
pub(crate) async fn select_capable(
    registry: &dyn AgentRegistry,
    capability: &str,
) -> Result<AgentProfile, CallFailure> {
    let criteria = SelectionCriteria {
        capabilities: vec![capability.to_string()],
        ..Default::default()
    };
    registry
        .select_agent(&criteria)
        .await
        .map_err(CallFailure::Registry)?
        .ok_or(CallFailure::NoAgent)
}

/// Dispatch a prompt and return the agent's final text, bounded by `timeout`.
pub(crate) async fn ask(
    platform: &dyn AgentPlatform,
    agent: &AgentProfile,
    prompt: String,
    timeout: Duration,
) -> Result<String, CallFailure> {
    let request = DispatchRequest::new(agent.id.clone(), prompt).with_model(agent.model.clone());
    let execution = match tokio::time::timeout(timeout, platform.dispatch(&request)).await {
        Ok(Ok(execution)) => execution,
        Ok(Err(e)) => return Err(CallFailure::Dispatch(e)),
        Err(_) => {
            return Err(CallFailure::Dispatch(DispatchError::TimedOut {
                seconds: timeout.as_secs(),
            }));
        }
    };
    let outcome = execution.into_outcome();
    if !outcome.success {
        return Err(CallFailure::AgentFailed(outcome.message));
    }
    Ok(outcome.message)
}
