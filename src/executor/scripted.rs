//! Deterministic agent platform that replays scripted replies.
//!
//! Replies are queued per agent id, with a shared fallback queue and a
//! default reply once both are drained. Every request is recorded so
//! callers can assert on instructions, models and sessions.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{AgentPlatform, DispatchRequest, Execution};
use crate::errors::DispatchError;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Raw stream-json lines and exit code
    Stream { lines: Vec<String>, exit_code: i32 },
    /// Transport failure
    Fail(String),
    /// Sleep before answering with the inner reply
    Delayed(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    /// A successful run whose final text is `text`.
    pub fn success(text: &str) -> Self {
        Self::completed(text, true, 0, 0, None)
    }

    /// A run that ended with an error result.
    pub fn failure(text: &str) -> Self {
        Self::completed(text, false, 0, 0, None)
    }

    /// A complete run with token usage and an optional session id.
    pub fn completed(text: &str, success: bool, input_tokens: u64, output_tokens: u64, session: Option<&str>) -> Self {
        let mut lines = Vec::new();
        if let Some(session) = session {
            lines.push(json!({"type": "system", "subtype": "init", "session_id": session}).to_string());
        }
        lines.push(
            json!({
                "type": "result",
                "subtype": if success { "success" } else { "error_during_execution" },
                "is_error": !success,
                "result": text,
                "duration_ms": 10,
                "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
                "session_id": session,
            })
            .to_string(),
        );
        ScriptedReply::Stream { lines, exit_code: 0 }
    }

    /// A successful run that wrote `count` files.
    pub fn with_artifacts(text: &str, count: usize) -> Self {
        let content: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "type": "tool_use",
                    "id": format!("tu{i}"),
                    "name": "Write",
                    "input": {"file_path": format!("src/file_{i}.rs")},
                })
            })
            .collect();
        let lines = vec![
            json!({"type": "assistant", "message": {"content": content}}).to_string(),
            json!({"type": "result", "subtype": "success", "is_error": false, "result": text}).to_string(),
        ];
        ScriptedReply::Stream { lines, exit_code: 0 }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        ScriptedReply::Delayed(delay, Box::new(self))
    }
}

pub struct ScriptedPlatform {
    by_agent: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    shared: Mutex<VecDeque<ScriptedReply>>,
    default_reply: ScriptedReply,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl Default for ScriptedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPlatform {
    /// Every dispatch succeeds unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_default(ScriptedReply::success("done"))
    }

    pub fn with_default(default_reply: ScriptedReply) -> Self {
        Self {
            by_agent: Mutex::new(HashMap::new()),
            shared: Mutex::new(VecDeque::new()),
            default_reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for any agent.
    pub fn push(&self, reply: ScriptedReply) -> &Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.push_back(reply);
        }
        self
    }

    /// Queue a reply for one agent id, ahead of the shared queue.
    pub fn push_for(&self, agent_id: &str, reply: ScriptedReply) -> &Self {
        if let Ok(mut by_agent) = self.by_agent.lock() {
            by_agent
                .entry(agent_id.to_string())
                .or_default()
                .push_back(reply);
        }
        self
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn requests_for(&self, agent_id: &str) -> Vec<DispatchRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect()
    }

    fn next_reply(&self, agent_id: &str) -> ScriptedReply {
        if let Ok(mut by_agent) = self.by_agent.lock()
            && let Some(reply) = by_agent.get_mut(agent_id).and_then(|q| q.pop_front())
        {
            return reply;
        }
        if let Ok(mut shared) = self.shared.lock()
            && let Some(reply) = shared.pop_front()
        {
            return reply;
        }
        self.default_reply.clone()
    }
}

#[async_trait]
impl AgentPlatform for ScriptedPlatform {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Execution, DispatchError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let mut reply = self.next_reply(&request.agent_id);
        loop {
            match reply {
                ScriptedReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                ScriptedReply::Fail(msg) => return Err(DispatchError::Other(anyhow::anyhow!(msg))),
                ScriptedReply::Stream { lines, exit_code } => {
                    return Ok(Execution {
                        lines,
                        exit_code: Some(exit_code),
                        elapsed: Duration::from_millis(10),
                    });
                }
            }
        }
    }
}
