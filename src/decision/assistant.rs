//! Worker Assistant: heuristic trigger, one-word AI directive.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CallFailure, EscalationContext, ask, select_capable};
use crate::agents::AgentRegistry;
use crate::executor::AgentPlatform;
use crate::outcome::Outcome;
use crate::policy::{Phase, Policy};
use crate::prompt::{self, Vars};
use crate::tracker::labels::{HITL_APPROVAL_REQUIRED, HITL_ASSISTANT_BLOCKED, HITL_MAX_RETRIES};
use crate::transition::{self, Transition, TransitionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantDirective {
    Advance,
    Retry,
    Block,
}

impl std::fmt::Display for AssistantDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssistantDirective::Advance => write!(f, "advance"),
            AssistantDirective::Retry => write!(f, "retry"),
            AssistantDirective::Block => write!(f, "block"),
        }
    }
}

/// `[worker_assistant]` section of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssistantConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_capability")]
    pub capability: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Directive used when the assistant is unavailable or unparseable
    #[serde(default = "default_fallback")]
    pub fallback_action: AssistantDirective,
    /// Successful outcomes touching more files than this are reviewed
    #[serde(default = "default_artifact_threshold")]
    pub artifact_threshold: usize,
    #[serde(default = "default_hedging_keywords")]
    pub hedging_keywords: Vec<String>,
    #[serde(default = "default_failure_keywords")]
    pub failure_keywords: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_capability() -> String {
    "worker-assistant".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_fallback() -> AssistantDirective {
    AssistantDirective::Block
}

fn default_artifact_threshold() -> usize {
    5
}

fn default_hedging_keywords() -> Vec<String> {
    ["unclear", "partial", "ambiguous", "review"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_failure_keywords() -> Vec<String> {
    ["detail", "timeout", "incomplete"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for WorkerAssistantConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capability: default_capability(),
            timeout_secs: default_timeout_secs(),
            fallback_action: default_fallback(),
            artifact_threshold: default_artifact_threshold(),
            hedging_keywords: default_hedging_keywords(),
            failure_keywords: default_failure_keywords(),
        }
    }
}

impl WorkerAssistantConfig {
    /// Disabled globally, for the policy, or for the phase.
    pub fn enabled_for(&self, policy: &Policy, phase: &Phase) -> bool {
        self.enabled && !policy.disable_worker_assistant && !phase.disable_worker_assistant
    }

    /// Why `outcome` is ambiguous enough to escalate, if it is.
    pub fn trigger_reason(&self, outcome: &Outcome) -> Option<String> {
        if outcome.success {
            if !outcome.warnings.is_empty() {
                return Some(format!("succeeded with {} warning(s)", outcome.warnings.len()));
            }
            if outcome.artifacts.len() > self.artifact_threshold {
                return Some(format!(
                    "succeeded touching {} files (threshold {})",
                    outcome.artifacts.len(),
                    self.artifact_threshold
                ));
            }
        }

        let message = outcome.message.to_lowercase();
        if let Some(keyword) = self
            .hedging_keywords
            .iter()
            .find(|k| message.contains(&k.to_lowercase()))
        {
            return Some(format!("message contains hedging keyword '{}'", keyword));
        }

        if !outcome.success
            && let Some(error) = &outcome.error
        {
            if error.details.is_some() {
                return Some("failure carries structured details".to_string());
            }
            let haystack = format!("{} {}", error.error_type, error.message).to_lowercase();
            if let Some(keyword) = self
                .failure_keywords
                .iter()
                .find(|k| haystack.contains(&k.to_lowercase()))
            {
                return Some(format!("failure mentions '{}'", keyword));
            }
        }
        None
    }
}

/// Extract exactly one directive from a free-form reply.
pub fn parse_directive(reply: &str) -> Option<AssistantDirective> {
    let upper = reply.to_uppercase();
    let found: Vec<AssistantDirective> = [
        ("ADVANCE", AssistantDirective::Advance),
        ("RETRY", AssistantDirective::Retry),
        ("BLOCK", AssistantDirective::Block),
    ]
    .into_iter()
    .filter(|(word, _)| upper.contains(word))
    .map(|(_, d)| d)
    .collect();

    match found.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

const ASSISTANT_TEMPLATE: &str = r#"You are supervising an automated coding agent. Its last run is ambiguous ({{trigger}}).

Issue {{issue_id}}: {{issue_title}}
Workflow {{policy}}, phase "{{phase}}" (attempt {{attempt}} of {{max_attempts}}), phases: {{phases}}
Engine's default decision: {{base_transition}}

Outcome: {{outcome_summary}}
Error: {{outcome_error}}
Warnings:
{{warnings}}
Files touched:
{{artifacts}}

Final message:
{{outcome_message}}

Answer with exactly one word:
ADVANCE - the phase's work is acceptable, move on
RETRY - run this phase again
BLOCK - a human needs to look at this
"#;

pub fn build_prompt(ctx: &EscalationContext<'_>, trigger: &str, base: &Transition) -> String {
    let mut vars = Vars::for_phase(ctx.issue, ctx.policy, ctx.phase).with_outcome(ctx.outcome);
    vars.set("trigger", trigger)
        .set("attempt", (ctx.retry_count + 1).to_string())
        .set("max_attempts", ctx.policy.retry.max_attempts.to_string())
        .set("base_transition", format!("{} ({})", base.kind, base.reason));
    prompt::render(ASSISTANT_TEMPLATE, &vars)
}

/// Result of consulting the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantVerdict {
    pub directive: AssistantDirective,
    /// Agent that answered, `None` when the fallback was used
    pub agent_id: Option<String>,
    /// Set when the fallback action was applied
    pub fallback_reason: Option<String>,
    pub reply: Option<String>,
}

impl AssistantVerdict {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

pub struct WorkerAssistant<'a> {
    config: &'a WorkerAssistantConfig,
    registry: &'a dyn AgentRegistry,
    platform: &'a dyn AgentPlatform,
}

impl<'a> WorkerAssistant<'a> {
    pub fn new(
        config: &'a WorkerAssistantConfig,
        registry: &'a dyn AgentRegistry,
        platform: &'a dyn AgentPlatform,
    ) -> Self {
        Self {
            config,
            registry,
            platform,
        }
    }

    fn fallback(&self, reason: String, agent_id: Option<String>, reply: Option<String>) -> AssistantVerdict {
        tracing::warn!(
            fallback = %self.config.fallback_action,
            reason = %reason,
            "worker assistant fell back"
        );
        AssistantVerdict {
            directive: self.config.fallback_action,
            agent_id,
            fallback_reason: Some(reason),
            reply,
        }
    }

    pub async fn consult(&self, ctx: &EscalationContext<'_>, trigger: &str, base: &Transition) -> AssistantVerdict {
        let agent = match select_capable(self.registry, &self.config.capability).await {
            Ok(agent) => agent,
            Err(CallFailure::NoAgent) => {
                return self.fallback(
                    format!("no active agent with capability '{}'", self.config.capability),
                    None,
                    None,
                );
            }
            Err(e) => return self.fallback(e.to_string(), None, None),
        };

        let prompt = build_prompt(ctx, trigger, base);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let reply = match ask(self.platform, &agent, prompt, timeout).await {
            Ok(reply) => reply,
            Err(e) => return self.fallback(e.to_string(), Some(agent.id), None),
        };

        match parse_directive(&reply) {
            Some(directive) => {
                tracing::info!(agent = %agent.id, directive = %directive, "worker assistant answered");
                AssistantVerdict {
                    directive,
                    agent_id: Some(agent.id),
                    fallback_reason: None,
                    reply: Some(reply),
                }
            }
            None => self.fallback(
                "reply did not contain exactly one of ADVANCE, RETRY, BLOCK".to_string(),
                Some(agent.id),
                Some(reply),
            ),
        }
    }
}

/// Whether the assistant may override `base` at all.
pub fn can_override(base: &Transition) -> bool {
    match base.kind {
        TransitionKind::DynamicDecision | TransitionKind::JumpBack => false,
        // An approval gate stays a human decision.
        TransitionKind::Block => base.hitl_reason.as_deref() != Some(HITL_APPROVAL_REQUIRED),
        TransitionKind::Advance | TransitionKind::Retry | TransitionKind::Close => true,
    }
}

/// Turn a directive into a transition for `phase`.
pub fn apply_directive(
    directive: AssistantDirective,
    policy: &Policy,
    phase: &Phase,
    retry_count: u32,
    note: &str,
) -> Transition {
    match directive {
        AssistantDirective::Advance => match policy.next_phase(&phase.name) {
            Some(next) => Transition::advance(next.name.clone(), format!("worker assistant: advance ({})", note)),
            None => Transition::close(format!("worker assistant: advance past last phase ({})", note)),
        },
        AssistantDirective::Retry => {
            let max_attempts = policy.retry.max_attempts;
            if retry_count < max_attempts.saturating_sub(1) {
                Transition::retry(
                    transition::retry_delay(&policy.retry, retry_count),
                    format!("worker assistant: retry ({})", note),
                )
            } else {
                Transition::block(
                    format!("max retries exceeded ({}) after worker assistant retry", max_attempts),
                    HITL_MAX_RETRIES,
                )
            }
        }
        AssistantDirective::Block => {
            Transition::block(format!("worker assistant: block ({})", note), HITL_ASSISTANT_BLOCKED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, StaticRegistry};
    use crate::executor::{ScriptedPlatform, ScriptedReply};
    use crate::outcome::ArtifactOperation;
    use crate::tracker::Issue;

    fn policy() -> Policy {
        Policy::new("feature", vec![Phase::new("plan"), Phase::new("implement")])
    }

    #[test]
    fn test_parse_directive() {
        assert_eq!(parse_directive("ADVANCE"), Some(AssistantDirective::Advance));
        assert_eq!(parse_directive("I'd say retry."), Some(AssistantDirective::Retry));
        assert_eq!(parse_directive("Blocked: needs a human"), Some(AssistantDirective::Block));
        assert_eq!(parse_directive("advance or retry"), None);
        assert_eq!(parse_directive("no idea"), None);
    }

    #[test]
    fn test_trigger_heuristics() {
        let config = WorkerAssistantConfig::default();
        assert!(config.trigger_reason(&Outcome::success("all good")).is_none());
        assert!(config.trigger_reason(&Outcome::success("done").with_warning("lint")).is_some());
        assert!(config.trigger_reason(&Outcome::success("Partial implementation")).is_some());

        let mut many = Outcome::success("done");
        for i in 0..6 {
            many = many.with_artifact(format!("f{i}.rs"), ArtifactOperation::Created);
        }
        assert!(config.trigger_reason(&many).unwrap().contains("6 files"));

        let five = (0..5).fold(Outcome::success("done"), |o, i| {
            o.with_artifact(format!("f{i}.rs"), ArtifactOperation::Created)
        });
        assert!(config.trigger_reason(&five).is_none());

        assert!(config.trigger_reason(&Outcome::failure("timeout", "slow")).is_some());
        assert!(config.trigger_reason(&Outcome::failure("incomplete", "stream ended")).is_some());
        assert!(config.trigger_reason(&Outcome::failure("transport", "socket closed")).is_none());
        let detailed = Outcome::failure("error", "x").with_error_details(serde_json::json!({"k": 1}));
        assert!(config.trigger_reason(&detailed).is_some());
    }

    #[test]
    fn test_enabled_for_respects_all_levels() {
        let config = WorkerAssistantConfig::default();
        let mut p = policy();
        assert!(config.enabled_for(&p, &p.phases[0]));
        p.phases[0].disable_worker_assistant = true;
        assert!(!config.enabled_for(&p, &p.phases[0]));
        assert!(config.enabled_for(&p, &p.phases[1]));
        p.disable_worker_assistant = true;
        assert!(!config.enabled_for(&p, &p.phases[1]));
        let off = WorkerAssistantConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!off.enabled_for(&policy(), &policy().phases[0]));
    }

    #[test]
    fn test_apply_directive() {
        let p = policy();
        let t = apply_directive(AssistantDirective::Advance, &p, &p.phases[0], 0, "ok");
        assert_eq!(t.kind, TransitionKind::Advance);
        let t = apply_directive(AssistantDirective::Advance, &p, &p.phases[1], 0, "ok");
        assert_eq!(t.kind, TransitionKind::Close);
        let t = apply_directive(AssistantDirective::Retry, &p, &p.phases[1], 0, "again");
        assert_eq!(t.kind, TransitionKind::Retry);
        let t = apply_directive(AssistantDirective::Retry, &p, &p.phases[1], 2, "again");
        assert_eq!(t.kind, TransitionKind::Block);
        let t = apply_directive(AssistantDirective::Block, &p, &p.phases[1], 0, "stop");
        assert_eq!(t.hitl_reason.as_deref(), Some(HITL_ASSISTANT_BLOCKED));
    }

    #[test]
    fn test_can_override() {
        assert!(can_override(&Transition::close("done")));
        assert!(!can_override(&Transition::block("approval required", "approval-required")));
        assert!(can_override(&Transition::block("max retries exceeded (3)", "max-retries")));
    }

    #[tokio::test]
    async fn test_unavailable_capability_uses_fallback() {
        let config = WorkerAssistantConfig::default();
        let registry = StaticRegistry::new(vec![AgentProfile::new("coder", &["coding"])]);
        let platform = ScriptedPlatform::new();
        let assistant = WorkerAssistant::new(&config, &registry, &platform);

        let p = policy();
        let issue = Issue::new("bd-1", "x");
        let outcome = Outcome::success("looks fine, ADVANCE");
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[0],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };
        let verdict = assistant
            .consult(&ctx, "test", &Transition::advance("implement", "done"))
            .await;
        assert_eq!(verdict.directive, AssistantDirective::Block);
        assert!(verdict.used_fallback());
        assert!(platform.requests().is_empty());
    }

    #[tokio::test]
    async fn test_assistant_reply_and_timeout() {
        let config = WorkerAssistantConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let registry = StaticRegistry::new(vec![AgentProfile::new("helper", &["worker-assistant"])]);
        let platform = ScriptedPlatform::new();
        platform.push(ScriptedReply::success("RETRY"));
        platform.push(ScriptedReply::success("ADVANCE").delayed(Duration::from_secs(5)));
        let assistant = WorkerAssistant::new(&config, &registry, &platform);

        let p = policy();
        let issue = Issue::new("bd-1", "x");
        let outcome = Outcome::success("partial");
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[0],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };
        let base = Transition::advance("implement", "done");

        let first = assistant.consult(&ctx, "hedging", &base).await;
        assert_eq!(first.directive, AssistantDirective::Retry);
        assert_eq!(first.agent_id.as_deref(), Some("helper"));
        assert!(platform.requests()[0].instructions.contains("Issue bd-1"));

        let second = assistant.consult(&ctx, "hedging", &base).await;
        assert_eq!(second.directive, AssistantDirective::Block);
        assert!(second.fallback_reason.unwrap().contains("timed out"));
    }
}
