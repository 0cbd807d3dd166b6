//! Parsing of the agent platform's `stream-json` event stream into an [`Outcome`].
//!
//! The Claude CLI, run with `--output-format stream-json --verbose`, emits one
//! JSON event per line: a `system` init event, `assistant` messages carrying
//! text and tool calls, `user` messages carrying tool results and a final
//! `result` event with cost, usage and duration. Agents can also embed
//! signal tags in their text:
//! - `<warning>text</warning>` adds a warning
//! - `<blocker>text</blocker>` fails an otherwise successful outcome
//! - `<approval-required/>` or `<approval-required>why</approval-required>` requests human approval

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use crate::outcome::{Artifact, ArtifactOperation, Outcome, OutcomeError, TokenUsage, ToolCall, ToolCallStatus};

static WARNING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<warning>\s*(.*?)\s*</warning>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>\s*(.*?)\s*</blocker>").unwrap());

static APPROVAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<approval-required\s*/>|<approval-required>\s*(.*?)\s*</approval-required>")
        .unwrap()
});

/// Events from the Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<UserMessage>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    fn to_tokens(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens,
            output: self.output_tokens,
        }
    }
}

struct ResultEvent {
    subtype: String,
    text: Option<String>,
    is_error: bool,
    duration_ms: Option<u64>,
    cost_usd: Option<f64>,
    tokens: Option<TokenUsage>,
}

/// Incrementally folds stream events into an [`Outcome`].
pub struct OutcomeParser {
    texts: Vec<String>,
    tool_calls: Vec<ToolCall>,
    pending: HashMap<String, (usize, Instant)>,
    artifacts: Vec<Artifact>,
    session_id: Option<String>,
    model: Option<String>,
    result: Option<ResultEvent>,
    skipped_lines: usize,
}

impl Default for OutcomeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeParser {
    pub fn new() -> Self {
        Self {
            texts: Vec::new(),
            tool_calls: Vec::new(),
            pending: HashMap::new(),
            artifacts: Vec::new(),
            session_id: None,
            model: None,
            result: None,
            skipped_lines: 0,
        }
    }

    /// Feed one raw line. Blank and non-JSON lines are counted and skipped.
    pub fn feed_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => self.feed_event(event),
            Err(e) => {
                self.skipped_lines += 1;
                tracing::debug!(error = %e, "skipping unparseable stream line");
            }
        }
    }

    pub fn feed_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::System {
                session_id, model, ..
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if model.is_some() {
                    self.model = model;
                }
            }
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if self.model.is_none() {
                    self.model = message.model;
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.texts.push(text),
                        ContentBlock::ToolUse { name, input, id } => self.record_tool_use(name, input, id),
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::User { message } => {
                if let Some(message) = message {
                    self.record_tool_results(&message.content);
                }
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                duration_ms,
                total_cost_usd,
                usage,
                session_id,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                self.result = Some(ResultEvent {
                    subtype,
                    text: result,
                    is_error,
                    duration_ms,
                    cost_usd: total_cost_usd,
                    tokens: usage.map(|u| u.to_tokens()),
                });
            }
            StreamEvent::Unknown => {}
        }
    }

    fn record_tool_use(&mut self, name: String, input: Value, id: String) {
        if let Some(path) = input.get("file_path").and_then(|v| v.as_str()) {
            let operation = match name.as_str() {
                "Write" => Some(ArtifactOperation::Created),
                "Edit" | "MultiEdit" | "NotebookEdit" => Some(ArtifactOperation::Modified),
                _ => None,
            };
            if let Some(operation) = operation {
                self.record_artifact(path, operation);
            }
        }

        let idx = self.tool_calls.len();
        self.tool_calls.push(ToolCall {
            name,
            inputs: input,
            outputs: None,
            status: ToolCallStatus::Pending,
            duration_ms: None,
        });
        if !id.is_empty() {
            self.pending.insert(id, (idx, Instant::now()));
        }
    }

    fn record_artifact(&mut self, path: &str, operation: ArtifactOperation) {
        // A file created earlier in the run stays "created" after later edits.
        if self.artifacts.iter().any(|a| a.path == path) {
            return;
        }
        self.artifacts.push(Artifact {
            path: path.to_string(),
            operation,
        });
    }

    fn record_tool_results(&mut self, content: &Value) {
        let Some(blocks) = content.as_array() else {
            return;
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some((idx, started)) = self.pending.remove(id)
                && let Some(call) = self.tool_calls.get_mut(idx)
            {
                let is_error = block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                call.status = if is_error {
                    ToolCallStatus::Error
                } else {
                    ToolCallStatus::Success
                };
                call.outputs = block.get("content").cloned();
                call.duration_ms = Some(started.elapsed().as_millis() as u64);
            }
        }
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Build the final outcome. `exit_code` is the agent process status when known.
    pub fn finish(self, exit_code: Option<i32>, elapsed: Duration) -> Outcome {
        let all_text = self.texts.join("\n");
        let mut outcome = match &self.result {
            Some(result) => {
                let message = result
                    .text
                    .clone()
                    .or_else(|| self.texts.last().cloned())
                    .unwrap_or_default();
                let success = !result.is_error && result.subtype == "success";
                Outcome {
                    success,
                    error: (!success).then(|| OutcomeError {
                        error_type: if result.subtype.is_empty() {
                            "error".to_string()
                        } else {
                            result.subtype.clone()
                        },
                        message: message.clone(),
                        details: None,
                    }),
                    message,
                    ..Default::default()
                }
            }
            None => Outcome::failure("incomplete", "agent stream ended without a result event")
                .with_error_details(serde_json::json!({
                    "exit_code": exit_code,
                    "skipped_lines": self.skipped_lines,
                })),
        };

        if outcome.success
            && let Some(code) = exit_code
            && code != 0
        {
            outcome.mark_failed("process_exit", format!("agent exited with code {}", code));
        }

        let tagged = match &self.result {
            Some(ResultEvent { text: Some(t), .. }) => format!("{}\n{}", all_text, t),
            _ => all_text,
        };
        apply_signal_tags(&mut outcome, &tagged);

        outcome.artifacts = self.artifacts;
        outcome.tool_calls = self.tool_calls;
        outcome.session_id = self.session_id;
        outcome.metrics.model = self.model;
        if let Some(result) = self.result {
            outcome.metrics.duration_ms = result
                .duration_ms
                .unwrap_or(elapsed.as_millis() as u64);
            outcome.metrics.cost_usd = result.cost_usd.unwrap_or_default();
            outcome.metrics.tokens = result.tokens.unwrap_or_default();
        } else {
            outcome.metrics.duration_ms = elapsed.as_millis() as u64;
        }
        outcome
    }
}

fn apply_signal_tags(outcome: &mut Outcome, text: &str) {
    for cap in WARNING_REGEX.captures_iter(text) {
        if let Some(m) = cap.get(1) {
            let warning = m.as_str().trim();
            if !warning.is_empty() && !outcome.warnings.iter().any(|w| w == warning) {
                outcome.warnings.push(warning.to_string());
            }
        }
    }

    for cap in APPROVAL_REGEX.captures_iter(text) {
        outcome.requires_approval = true;
        if let Some(m) = cap.get(1) {
            let why = m.as_str().trim();
            if !why.is_empty() {
                outcome.warnings.push(format!("approval requested: {}", why));
            }
        }
    }

    let blockers: Vec<&str> = BLOCKER_REGEX
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .filter(|b| !b.is_empty())
        .collect();
    if outcome.success && !blockers.is_empty() {
        outcome.mark_failed("blocker", blockers.join("; "));
    }
}

/// Parse a complete captured stream in one go.
pub fn parse_stream(output: &str, exit_code: Option<i32>) -> Outcome {
    let mut parser = OutcomeParser::new();
    for line in output.lines() {
        parser.feed_line(line);
    }
    parser.finish(exit_code, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude-sonnet"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Writing the module"},{"type":"tool_use","id":"tu1","name":"Write","input":{"file_path":"src/lib.rs","content":"x"}}]},"session_id":"sess-1"}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"ok","is_error":false}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu2","name":"Edit","input":{"file_path":"src/lib.rs"}},{"type":"tool_use","id":"tu3","name":"Bash","input":{"command":"cargo test"}}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu3","content":"1 failed","is_error":true}]}}
{"type":"result","subtype":"success","is_error":false,"duration_ms":4200,"total_cost_usd":0.25,"result":"Done <warning>tests are flaky</warning>","usage":{"input_tokens":1000,"output_tokens":200,"cache_read_input_tokens":500},"session_id":"sess-1"}"#;

    #[test]
    fn test_parse_full_session() {
        let outcome = parse_stream(SESSION, Some(0));
        assert!(outcome.success);
        assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
        assert_eq!(outcome.metrics.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(outcome.metrics.duration_ms, 4200);
        assert_eq!(outcome.metrics.tokens.input, 1500);
        assert_eq!(outcome.metrics.tokens.output, 200);
        assert_eq!(outcome.metrics.cost_usd, 0.25);
        assert_eq!(outcome.warnings, vec!["tests are flaky"]);

        // Write then Edit of the same file stays a single "created" artifact
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].operation, ArtifactOperation::Created);

        assert_eq!(outcome.tool_calls.len(), 3);
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Success);
        assert_eq!(outcome.tool_calls[1].status, ToolCallStatus::Pending);
        assert_eq!(outcome.tool_calls[2].status, ToolCallStatus::Error);
    }

    #[test]
    fn test_missing_result_is_incomplete() {
        let stream = r#"{"type":"system","subtype":"init","session_id":"s"}
{"type":"assistant","message":{"content":[{"type":"text","text":"working..."}]}}"#;
        let outcome = parse_stream(stream, Some(137));
        assert!(!outcome.success);
        assert_eq!(outcome.error_type(), Some("incomplete"));
        assert_eq!(outcome.session_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_error_result() {
        let stream = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"result":"ran out of turns"}"#;
        let outcome = parse_stream(stream, Some(0));
        assert!(!outcome.success);
        assert_eq!(outcome.error_type(), Some("error_max_turns"));
    }

    #[test]
    fn test_nonzero_exit_fails_success_result() {
        let stream = r#"{"type":"result","subtype":"success","is_error":false,"result":"ok"}"#;
        let outcome = parse_stream(stream, Some(1));
        assert!(!outcome.success);
        assert_eq!(outcome.error_type(), Some("process_exit"));
    }

    #[test]
    fn test_blocker_and_approval_tags() {
        let stream = r#"{"type":"result","subtype":"success","is_error":false,"result":"<blocker>missing API key</blocker> <approval-required>touches billing</approval-required>"}"#;
        let outcome = parse_stream(stream, None);
        assert!(!outcome.success);
        assert_eq!(outcome.error_type(), Some("blocker"));
        assert!(outcome.requires_approval);
        assert!(outcome.warnings.iter().any(|w| w.contains("touches billing")));
    }

    #[test]
    fn test_self_closing_approval_tag() {
        let stream = r#"{"type":"result","subtype":"success","is_error":false,"result":"ready <approval-required/>"}"#;
        let outcome = parse_stream(stream, Some(0));
        assert!(outcome.success);
        assert!(outcome.requires_approval);
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let mut parser = OutcomeParser::new();
        parser.feed_line("not json");
        parser.feed_line("");
        parser.feed_line(r#"{"type":"rate_limit","retry_after":3}"#);
        parser.feed_line(r#"{"type":"result","subtype":"success","is_error":false,"result":"fine"}"#);
        assert_eq!(parser.skipped_lines(), 1);
        let outcome = parser.finish(None, Duration::from_millis(900));
        assert!(outcome.success);
        assert_eq!(outcome.metrics.duration_ms, 900);
    }
}
