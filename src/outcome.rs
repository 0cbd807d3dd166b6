//! Structured result of one agent execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactOperation {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ArtifactOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactOperation::Created => write!(f, "created"),
            ArtifactOperation::Modified => write!(f, "modified"),
            ArtifactOperation::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub operation: ArtifactOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub duration_ms: u64,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The agent asked for a human to approve its work
    #[serde(default)]
    pub requires_approval: bool,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            error: Some(OutcomeError {
                error_type: error_type.into(),
                message: message.clone(),
                details: None,
            }),
            message,
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>, operation: ArtifactOperation) -> Self {
        self.artifacts.push(Artifact {
            path: path.into(),
            operation,
        });
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.metrics.tokens = TokenUsage { input, output };
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.metrics.duration_ms = duration_ms;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_error_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Force the outcome to failure, keeping the original message as context.
    pub fn mark_failed(&mut self, error_type: &str, message: String) {
        self.success = false;
        self.error = Some(OutcomeError {
            error_type: error_type.to_string(),
            message: message.clone(),
            details: None,
        });
        if self.message.is_empty() {
            self.message = message;
        } else {
            self.message = format!("{} ({})", message, self.message);
        }
    }

    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.error_type.as_str())
    }

    /// One-line summary used in notes and prompts.
    pub fn summary(&self) -> String {
        let status = if self.success { "success" } else { "failure" };
        let mut parts = vec![format!("{}: {}", status, truncate(&self.message, 200))];
        if let Some(err) = &self.error {
            parts.push(format!("error[{}]: {}", err.error_type, truncate(&err.message, 200)));
        }
        if !self.artifacts.is_empty() {
            parts.push(format!("{} artifacts", self.artifacts.len()));
        }
        if !self.warnings.is_empty() {
            parts.push(format!("{} warnings", self.warnings.len()));
        }
        parts.join("; ")
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
