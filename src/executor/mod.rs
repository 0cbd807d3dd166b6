//! Agent execution platform port.
//!
//! A dispatch hands instructions to one agent and waits for it to finish,
//! returning the raw structured event stream. Parsing that stream into an
//! [`Outcome`] is the caller's job (see [`Execution::into_outcome`]).

pub mod claude;
pub mod scripted;

pub use claude::ClaudePlatform;
pub use scripted::{ScriptedPlatform, ScriptedReply};

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::DispatchError;
use crate::outcome::Outcome;
use crate::stream::OutcomeParser;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub agent_id: String,
    /// Resolved model, `None` means the platform default
    pub model: Option<String>,
    pub instructions: String,
    /// Session to resume instead of starting fresh
    pub session_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(agent_id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: None,
            instructions: instructions.into(),
            session_id: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Raw result of one agent process: its event lines and exit status.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub lines: Vec<String>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl Execution {
    pub fn into_outcome(self) -> Outcome {
        let mut parser = OutcomeParser::new();
        for line in &self.lines {
            parser.feed_line(line);
        }
        parser.finish(self.exit_code, self.elapsed)
    }
}

#[async_trait]
pub trait AgentPlatform: Send + Sync {
    /// Run one agent to completion. Errors are transport failures only;
    /// an agent that ran and failed still returns `Ok`.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Execution, DispatchError>;
}

/// Convert a transport failure into a failed outcome so it flows through retry/block.
pub fn transport_failure(err: &DispatchError, elapsed: Duration) -> Outcome {
    Outcome::failure(err.kind(), format!("agent dispatch failed: {}", err))
        .with_duration_ms(elapsed.as_millis() as u64)
}
