//! Decision Agent: resolves `dynamic_decision` into a concrete route.
//!
//! The agent is asked for a JSON object:
//!
//! ```json
//! {
//!   "decision": "jump_to_implement",
//!   "reasoning": "tests fail on the new parser",
//!   "confidence": 0.82,
//!   "requires_approval": false,
//!   "recommendations": ["add a regression test"]
//! }
//! ```
//!
//! `decision` is `require_approval`, `jump_to_<phase>` or `advance_to_<phase>`
//! with the phase inside the allowed destinations. Invalid replies are
//! re-prompted a bounded number of times, then the issue is blocked.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::{EscalationContext, ask, select_capable};
use crate::agents::AgentRegistry;
use crate::executor::AgentPlatform;
use crate::policy::{ConfidenceThresholds, DecisionConfig};
use crate::prompt::{self, Vars};
use crate::tracker::labels::{HITL_APPROVAL_REQUIRED, HITL_DECISION_BLOCKED};
use crate::transition::Transition;

/// Built-in decision prompt, overridable per phase via `[templates]`.
pub const DEFAULT_DECISION_TEMPLATE: &str = r#"You are the routing agent for an automated development workflow.

Issue {{issue_id}}: {{issue_title}} ({{issue_type}})
{{issue_description}}

Workflow "{{policy}}": {{phases}}
The "{{phase}}" phase just finished.
Phase history: {{history}}

Outcome: {{outcome_summary}}
Error: {{outcome_error}}
Warnings:
{{warnings}}
Files touched:
{{artifacts}}

Final message:
{{outcome_message}}

Decide where this issue goes next. Valid decisions:
{{valid_decisions}}

Replies with confidence below {{require_approval_threshold}} are sent to a human.

Respond with ONLY a JSON object:
{"decision": "<one of the valid decisions>", "reasoning": "<why>", "confidence": <0.0-1.0>, "requires_approval": <true|false>, "recommendations": ["<optional>"]}
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReply {
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    RequireApproval,
    JumpTo(String),
    AdvanceTo(String),
}

/// Pull a JSON object out of a reply that may wrap it in prose or a code fence.
pub fn extract_json(response: &str) -> Option<&str> {
    if let Some(start) = response.find("```") {
        let after = &response[start + 3..];
        if let Some(end) = after.find("```") {
            let block = &after[..end];
            if let Some(brace) = block.find('{') {
                return Some(block[brace..].trim());
            }
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&response[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and schema-check a reply.
pub fn parse_reply(response: &str) -> Result<DecisionReply, String> {
    let json = extract_json(response).ok_or_else(|| "reply contains no JSON object".to_string())?;
    let value: Value = serde_json::from_str(json).map_err(|e| format!("reply is not valid JSON: {}", e))?;

    let decision = value
        .get("decision")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| "missing string field 'decision'".to_string())?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string field 'reasoning'".to_string())?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| "missing numeric field 'confidence'".to_string())?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {} is outside [0, 1]", confidence));
    }
    let requires_approval = match value.get("requires_approval") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err("'requires_approval' must be a boolean".to_string()),
    };
    let recommendations = value
        .get("recommendations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(DecisionReply {
        decision: decision.to_string(),
        reasoning: reasoning.to_string(),
        confidence,
        requires_approval,
        recommendations,
    })
}

/// Check the decision names an allowed route.
pub fn validate(reply: &DecisionReply, allowed: &[&str]) -> Result<Route, String> {
    let decision = reply.decision.as_str();
    if decision == "require_approval" {
        return Ok(Route::RequireApproval);
    }
    let (target, route): (&str, fn(String) -> Route) =
        if let Some(target) = decision.strip_prefix("jump_to_") {
            (target, Route::JumpTo)
        } else if let Some(target) = decision.strip_prefix("advance_to_") {
            (target, Route::AdvanceTo)
        } else {
            return Err(format!(
                "decision '{}' must be require_approval, jump_to_<phase> or advance_to_<phase>",
                decision
            ));
        };
    if !allowed.contains(&target) {
        return Err(format!(
            "phase '{}' is not an allowed destination (allowed: {})",
            target,
            allowed.join(", ")
        ));
    }
    Ok(route(target.to_string()))
}

/// Turn a validated reply into a transition, gating on approval and confidence.
pub fn resolve(route: &Route, reply: &DecisionReply, thresholds: &ConfidenceThresholds) -> Transition {
    let approval = || {
        Transition::block(
            format!("decision agent requested approval: {}", reply.reasoning),
            HITL_APPROVAL_REQUIRED,
        )
    };
    if reply.requires_approval {
        return approval();
    }
    if reply.confidence < thresholds.require_approval {
        return Transition::block(
            format!(
                "decision '{}' confidence {:.2} below approval threshold {:.2}",
                reply.decision, reply.confidence, thresholds.require_approval
            ),
            HITL_APPROVAL_REQUIRED,
        );
    }
    let reason = format!(
        "decision agent ({:.2}): {}",
        reply.confidence, reply.reasoning
    );
    match route {
        Route::JumpTo(target) => Transition::jump_back(target.clone(), reason),
        Route::AdvanceTo(target) => Transition::advance(target.clone(), reason),
        Route::RequireApproval => approval(),
    }
}

fn valid_decisions(allowed: &[&str]) -> String {
    let mut lines = vec!["- require_approval".to_string()];
    for phase in allowed {
        lines.push(format!("- jump_to_{}", phase));
        lines.push(format!("- advance_to_{}", phase));
    }
    lines.join("\n")
}

pub fn build_prompt(ctx: &EscalationContext<'_>, config: &DecisionConfig, template: &str) -> String {
    let allowed = config.destinations(ctx.policy);
    let mut vars = Vars::for_phase(ctx.issue, ctx.policy, ctx.phase).with_outcome(ctx.outcome);
    vars.set("history", prompt::visit_history(ctx.history))
        .set("allowed_destinations", allowed.join(", "))
        .set("valid_decisions", valid_decisions(&allowed))
        .set(
            "require_approval_threshold",
            format!("{:.2}", config.thresholds.require_approval),
        );
    prompt::render(template, &vars)
}

fn clarification(error: &str, allowed: &[&str]) -> String {
    format!(
        "\n\nYour previous reply was rejected: {}.\nReply with ONLY the JSON object described above. \"decision\" must be exactly one of:\n{}\n\"confidence\" must be a number between 0.0 and 1.0.",
        error,
        valid_decisions(allowed)
    )
}

/// Outcome of a decision agent consultation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionVerdict {
    pub transition: Transition,
    pub agent_id: Option<String>,
    pub reply: Option<DecisionReply>,
    /// Prompts sent, including re-prompts
    pub attempts: u32,
    /// Rejection reason for each failed attempt
    pub failures: Vec<String>,
}

pub struct DecisionAgent<'a> {
    registry: &'a dyn AgentRegistry,
    platform: &'a dyn AgentPlatform,
    templates: &'a HashMap<String, String>,
}

impl<'a> DecisionAgent<'a> {
    pub fn new(
        registry: &'a dyn AgentRegistry,
        platform: &'a dyn AgentPlatform,
        templates: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            platform,
            templates,
        }
    }

    fn template(&self, config: &DecisionConfig) -> &str {
        config
            .prompt_template
            .as_ref()
            .and_then(|key| self.templates.get(key))
            .map(String::as_str)
            .unwrap_or(DEFAULT_DECISION_TEMPLATE)
    }

    pub async fn decide(&self, ctx: &EscalationContext<'_>, config: &DecisionConfig) -> DecisionVerdict {
        let agent = match select_capable(self.registry, &config.capability).await {
            Ok(agent) => agent,
            Err(e) => {
                let reason = format!(
                    "decision agent '{}' unavailable: {}",
                    config.capability, e
                );
                tracing::warn!(issue = %ctx.issue.id, reason = %reason, "blocking");
                return DecisionVerdict {
                    transition: Transition::block(reason.clone(), HITL_DECISION_BLOCKED),
                    agent_id: None,
                    reply: None,
                    attempts: 0,
                    failures: vec![reason],
                };
            }
        };

        let allowed = config.destinations(ctx.policy);
        let base_prompt = build_prompt(ctx, config, self.template(config));
        let timeout = Duration::from_secs(config.timeout_secs);
        let max_attempts = config.max_reprompts + 1;
        let mut failures: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            let prompt = match failures.last() {
                Some(err) => format!("{}{}", base_prompt, clarification(err, &allowed)),
                None => base_prompt.clone(),
            };

            let checked = match ask(self.platform, &agent, prompt, timeout).await {
                Ok(text) => parse_reply(&text)
                    .and_then(|reply| validate(&reply, &allowed).map(|route| (reply, route))),
                Err(e) => Err(e.to_string()),
            };

            match checked {
                Ok((reply, route)) => {
                    let transition = resolve(&route, &reply, &config.thresholds);
                    tracing::info!(
                        issue = %ctx.issue.id,
                        agent = %agent.id,
                        decision = %reply.decision,
                        confidence = reply.confidence,
                        transition = %transition.kind,
                        "decision agent answered"
                    );
                    return DecisionVerdict {
                        transition,
                        agent_id: Some(agent.id),
                        reply: Some(reply),
                        attempts: attempt,
                        failures,
                    };
                }
                Err(err) => {
                    tracing::warn!(issue = %ctx.issue.id, attempt, error = %err, "decision reply rejected");
                    failures.push(err);
                }
            }
        }

        let last = failures.last().cloned().unwrap_or_default();
        DecisionVerdict {
            transition: Transition::block(
                format!(
                    "decision agent gave no valid answer after {} attempts: {}",
                    max_attempts, last
                ),
                HITL_DECISION_BLOCKED,
            ),
            agent_id: Some(agent.id),
            reply: None,
            attempts: max_attempts,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, StaticRegistry};
    use crate::executor::{ScriptedPlatform, ScriptedReply};
    use crate::outcome::Outcome;
    use crate::policy::{Phase, Policy};
    use crate::tracker::Issue;
    use crate::transition::TransitionKind;

    fn policy() -> Policy {
        Policy::new(
            "feature",
            vec![
                Phase::new("implement"),
                Phase::new("test"),
                Phase::new("review"),
                Phase::new("deploy"),
            ],
        )
    }

    fn reply(decision: &str, confidence: f64) -> DecisionReply {
        DecisionReply {
            decision: decision.to_string(),
            reasoning: "because".to_string(),
            confidence,
            requires_approval: false,
            recommendations: vec![],
        }
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
        assert_eq!(
            extract_json("Sure:\n```json\n{\"a\": {\"b\": 2}}\n```\nthanks"),
            Some("{\"a\": {\"b\": 2}}")
        );
        assert_eq!(
            extract_json(r#"prefix {"text": "brace } inside", "n": 1} suffix"#),
            Some(r#"{"text": "brace } inside", "n": 1}"#)
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{ unterminated"), None);
    }

    #[test]
    fn test_parse_reply_schema() {
        let ok = parse_reply(
            r#"{"decision": "jump_to_test", "reasoning": "r", "confidence": 0.9, "recommendations": ["x"]}"#,
        )
        .unwrap();
        assert_eq!(ok.decision, "jump_to_test");
        assert_eq!(ok.recommendations, vec!["x"]);
        assert!(!ok.requires_approval);

        assert!(parse_reply(r#"{"reasoning": "r", "confidence": 0.9}"#).is_err());
        assert!(parse_reply(r#"{"decision": "x", "reasoning": "r", "confidence": 1.5}"#).is_err());
        assert!(parse_reply(r#"{"decision": "x", "reasoning": "r", "confidence": "high"}"#).is_err());
        assert!(
            parse_reply(r#"{"decision": "x", "reasoning": "r", "confidence": 0.5, "requires_approval": "yes"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_validate_routes() {
        let allowed = ["implement", "deploy"];
        assert_eq!(
            validate(&reply("jump_to_implement", 0.9), &allowed),
            Ok(Route::JumpTo("implement".to_string()))
        );
        assert_eq!(
            validate(&reply("advance_to_deploy", 0.9), &allowed),
            Ok(Route::AdvanceTo("deploy".to_string()))
        );
        assert_eq!(validate(&reply("require_approval", 0.9), &allowed), Ok(Route::RequireApproval));
        assert!(validate(&reply("jump_to_test", 0.9), &allowed).is_err());
        assert!(validate(&reply("go_to_deploy", 0.9), &allowed).is_err());
    }

    #[test]
    fn test_low_confidence_blocks_valid_decision() {
        let thresholds = ConfidenceThresholds {
            require_approval: 0.6,
        };
        let r = reply("jump_to_test", 0.4);
        let route = validate(&r, &["test"]).unwrap();
        let t = resolve(&route, &r, &thresholds);
        assert_eq!(t.kind, TransitionKind::Block);
        assert!(t.reason.contains("below approval threshold"));

        let confident = reply("jump_to_test", 0.6);
        assert_eq!(resolve(&route, &confident, &thresholds).kind, TransitionKind::JumpBack);
    }

    #[test]
    fn test_requires_approval_flag_blocks() {
        let mut r = reply("advance_to_deploy", 0.95);
        r.requires_approval = true;
        let t = resolve(&Route::AdvanceTo("deploy".to_string()), &r, &ConfidenceThresholds::default());
        assert_eq!(t.kind, TransitionKind::Block);
        assert_eq!(t.hitl_reason.as_deref(), Some(HITL_APPROVAL_REQUIRED));
    }

    fn context_fixture() -> (Policy, Issue, Outcome) {
        (policy(), Issue::new("bd-5", "parser"), Outcome::success("review done"))
    }

    #[tokio::test]
    async fn test_decide_reprompts_then_succeeds() {
        let (p, issue, outcome) = context_fixture();
        let registry = StaticRegistry::new(vec![AgentProfile::new("router", &["decision"])]);
        let platform = ScriptedPlatform::new();
        platform.push(ScriptedReply::success("I think we should go back"));
        platform.push(ScriptedReply::success(
            r#"{"decision": "jump_to_implement", "reasoning": "bugs", "confidence": 0.8}"#,
        ));
        let templates = HashMap::new();
        let agent = DecisionAgent::new(&registry, &platform, &templates);
        let config = DecisionConfig::default().with_destinations(&["implement", "deploy"]);
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[2],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };

        let verdict = agent.decide(&ctx, &config).await;
        assert_eq!(verdict.transition.kind, TransitionKind::JumpBack);
        assert_eq!(verdict.transition.next_phase.as_deref(), Some("implement"));
        assert_eq!(verdict.attempts, 2);
        assert_eq!(verdict.failures.len(), 1);

        let requests = platform.requests();
        assert!(!requests[0].instructions.contains("previous reply was rejected"));
        assert!(requests[1].instructions.contains("previous reply was rejected"));
        assert!(requests[1].instructions.contains("jump_to_deploy"));
    }

    #[tokio::test]
    async fn test_decide_blocks_after_three_invalid_replies() {
        let (p, issue, outcome) = context_fixture();
        let registry = StaticRegistry::new(vec![AgentProfile::new("router", &["decision"])]);
        let platform = ScriptedPlatform::with_default(ScriptedReply::success(
            r#"{"decision": "jump_to_test", "reasoning": "x", "confidence": 0.9}"#,
        ));
        let templates = HashMap::new();
        let agent = DecisionAgent::new(&registry, &platform, &templates);
        let config = DecisionConfig::default().with_destinations(&["implement"]);
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[2],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };

        let verdict = agent.decide(&ctx, &config).await;
        assert_eq!(verdict.transition.kind, TransitionKind::Block);
        assert!(verdict.transition.reason.contains("not an allowed destination"));
        assert_eq!(verdict.attempts, 3);
        assert_eq!(platform.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_decide_without_agent_blocks() {
        let (p, issue, outcome) = context_fixture();
        let registry = StaticRegistry::new(vec![]);
        let platform = ScriptedPlatform::new();
        let templates = HashMap::new();
        let agent = DecisionAgent::new(&registry, &platform, &templates);
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[2],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };
        let verdict = agent.decide(&ctx, &DecisionConfig::default()).await;
        assert!(verdict.transition.is_block());
        assert_eq!(verdict.attempts, 0);
        assert!(platform.requests().is_empty());
    }

    #[test]
    fn test_custom_template_lookup() {
        let (p, issue, outcome) = context_fixture();
        let registry = StaticRegistry::new(vec![]);
        let platform = ScriptedPlatform::new();
        let mut templates = HashMap::new();
        templates.insert("terse".to_string(), "Route {{issue_id}}: {{allowed_destinations}}".to_string());
        let agent = DecisionAgent::new(&registry, &platform, &templates);
        let mut config = DecisionConfig::default().with_destinations(&["implement", "deploy"]);
        config.prompt_template = Some("terse".to_string());
        let ctx = EscalationContext {
            issue: &issue,
            policy: &p,
            phase: &p.phases[2],
            outcome: &outcome,
            retry_count: 0,
            history: &[],
        };
        assert_eq!(
            build_prompt(&ctx, &config, agent.template(&config)),
            "Route bd-5: implement, deploy"
        );
    }
}
