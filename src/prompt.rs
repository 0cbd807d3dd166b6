//! Prompt templates.
//!
//! Templates use `{{name}}` placeholders. Unknown placeholders are left in
//! place so a typo shows up in the prompt instead of vanishing silently.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::audit::Run;
use crate::messenger::PhaseMessage;
use crate::outcome::Outcome;
use crate::policy::{Phase, Policy};
use crate::tracker::Issue;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").unwrap());

/// Instructions sent to a phase agent when the phase has no custom template.
pub const DEFAULT_PHASE_TEMPLATE: &str = r#"You are working on issue {{issue_id}}: {{issue_title}}
Type: {{issue_type}}
Workflow: {{policy}} (phase {{phase_position}} of {{phase_count}})

## Description
{{issue_description}}

## Current phase: {{phase}}
Complete the "{{phase}}" phase for this issue and nothing beyond it.
{{messages}}
## Signals
- Wrap anything the reviewer should know in <warning>...</warning>.
- If you cannot proceed, explain why inside <blocker>...</blocker>.
- If a human must approve your work before it moves on, include <approval-required>reason</approval-required>.
"#;

/// Template variables, rendered with [`render`].
#[derive(Debug, Default, Clone)]
pub struct Vars(HashMap<&'static str, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Issue, policy and phase variables.
    pub fn for_phase(issue: &Issue, policy: &Policy, phase: &Phase) -> Self {
        let mut vars = Self::new();
        let position = policy.phase_index(&phase.name).map(|i| i + 1).unwrap_or(0);
        vars.set("issue_id", issue.id.clone())
            .set("issue_title", issue.title.clone())
            .set("issue_type", issue.issue_type.clone())
            .set(
                "issue_description",
                if issue.description.trim().is_empty() {
                    "(no description)".to_string()
                } else {
                    issue.description.clone()
                },
            )
            .set("policy", policy.name.clone())
            .set("phase", phase.name.clone())
            .set("phase_position", position.to_string())
            .set("phase_count", policy.phases.len().to_string())
            .set(
                "phases",
                policy
                    .phases
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> "),
            )
            .set("messages", String::new());
        vars
    }

    /// Outcome variables for escalation prompts.
    pub fn with_outcome(mut self, outcome: &Outcome) -> Self {
        self.set("outcome_status", if outcome.success { "success" } else { "failure" })
            .set("outcome_summary", outcome.summary())
            .set("outcome_message", crate::outcome::truncate(&outcome.message, 2000))
            .set(
                "outcome_error",
                outcome
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.error_type, e.message))
                    .unwrap_or_else(|| "none".to_string()),
            )
            .set("warnings", bullet_list(&outcome.warnings))
            .set(
                "artifacts",
                bullet_list(
                    &outcome
                        .artifacts
                        .iter()
                        .map(|a| format!("{} ({})", a.path, a.operation))
                        .collect::<Vec<_>>(),
                ),
            );
        self
    }

    /// Unread inter-phase messages, rendered as a section.
    pub fn with_messages(mut self, messages: &[PhaseMessage]) -> Self {
        if !messages.is_empty() {
            let mut section = String::from("\n## Messages from earlier phases\n");
            for msg in messages {
                section.push_str(&format!(
                    "- [{} from {}] {}\n",
                    msg.message_type, msg.from_phase, msg.content
                ));
            }
            self.set("messages", section);
        }
        self
    }
}

/// Phase-visit history, e.g. `plan (completed) -> implement (failed)`.
pub fn visit_history(runs: &[Run]) -> String {
    if runs.is_empty() {
        return "(first visit)".to_string();
    }
    runs.iter()
        .map(|r| format!("{} ({})", r.phase, r.status))
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- none".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render(template: &str, vars: &Vars) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            vars.get(key)
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
