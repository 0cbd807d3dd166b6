//! Session continuation.
//!
//! A phase may declare a reuse target (`@shared`, `@previous`, `@self`,
//! `@first` or a phase name). The target resolves to a concrete earlier
//! phase, whose most recent completed run supplies the session id. Reuse is
//! allowed only while the tokens already spent in that session stay below
//! `threshold × max_context_tokens`.

use serde::{Deserialize, Serialize};

use crate::audit::Run;
use crate::policy::{Phase, Policy, SessionTarget};

/// `[session]` section of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fraction of the context window a reused session may already occupy
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.8
}

fn default_max_context_tokens() -> u64 {
    130_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            threshold: default_threshold(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

impl SessionConfig {
    pub fn token_budget(&self) -> u64 {
        (self.max_context_tokens as f64 * self.threshold).floor() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionDecision {
    /// The phase declares no reuse target
    NotRequested,
    Reuse {
        session_id: String,
        source_phase: String,
        tokens_used: u64,
    },
    /// Reuse was requested but denied; dispatch starts a fresh session
    Fresh { reason: String },
}

impl SessionDecision {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionDecision::Reuse { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// Concrete phase a target points at, given the issue's run history.
pub fn resolve_target(policy: &Policy, phase: &Phase, target: &SessionTarget, runs: &[Run]) -> Option<String> {
    match target {
        SessionTarget::Shared => runs
            .iter()
            .rev()
            .find(|r| is_completed(r))
            .map(|r| r.phase.clone()),
        SessionTarget::Previous => policy.previous_phase(&phase.name).map(|p| p.name.clone()),
        SessionTarget::SelfPhase => Some(phase.name.clone()),
        SessionTarget::First => policy.first_phase().map(|p| p.name.clone()),
        SessionTarget::Phase(name) => Some(name.clone()),
    }
}

fn is_completed(run: &Run) -> bool {
    run.status.is_terminal() && run.succeeded()
}

/// Decide whether `phase` may resume an earlier session. `runs` are the issue's runs, oldest first.
pub fn decide(config: &SessionConfig, policy: &Policy, phase: &Phase, runs: &[Run]) -> SessionDecision {
    let Some(target) = &phase.reuse_session else {
        return SessionDecision::NotRequested;
    };
    if !config.enabled {
        return SessionDecision::Fresh {
            reason: "session continuation disabled".to_string(),
        };
    }

    let Some(source_phase) = resolve_target(policy, phase, target, runs) else {
        return SessionDecision::Fresh {
            reason: format!("reuse target {} has no matching phase", target),
        };
    };

    let Some(source_run) = runs
        .iter()
        .rev()
        .find(|r| r.phase == source_phase && is_completed(r))
    else {
        return SessionDecision::Fresh {
            reason: format!("no completed run of phase '{}'", source_phase),
        };
    };

    let Some(session_id) = source_run.metadata.session_id.clone() else {
        return SessionDecision::Fresh {
            reason: format!("latest '{}' run recorded no session", source_phase),
        };
    };

    let tokens_used: u64 = runs
        .iter()
        .filter(|r| r.metadata.session_id.as_deref() == Some(session_id.as_str()))
        .map(Run::tokens_used)
        .sum();

    let budget = config.token_budget();
    if tokens_used >= budget {
        return SessionDecision::Fresh {
            reason: format!(
                "session {} already used {} tokens (limit {} = {} x {})",
                session_id, tokens_used, budget, config.threshold, config.max_context_tokens
            ),
        };
    }

    SessionDecision::Reuse {
        session_id,
        source_phase,
        tokens_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RunStatus;
    use crate::outcome::Outcome;

    fn policy() -> Policy {
        Policy::new(
            "feature",
            vec![
                Phase::new("plan"),
                Phase::new("implement").with_session_reuse(SessionTarget::Previous),
                Phase::new("test").with_session_reuse(SessionTarget::First),
            ],
        )
    }

    fn run(phase: &str, success: bool, session: &str, tokens: u64) -> Run {
        let mut run = Run::new("bd-1", "coder", "feature", phase);
        let outcome = if success {
            Outcome::success("ok")
        } else {
            Outcome::failure("error", "nope")
        };
        let status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        run.finish(status, outcome.with_session(session).with_tokens(tokens, 0));
        run
    }

    #[test]
    fn test_not_requested() {
        let p = policy();
        assert_eq!(
            decide(&SessionConfig::default(), &p, &p.phases[0], &[]),
            SessionDecision::NotRequested
        );
    }

    #[test]
    fn test_reuse_previous_phase_session() {
        let p = policy();
        let runs = vec![run("plan", true, "s-1", 20_000)];
        let decision = decide(&SessionConfig::default(), &p, &p.phases[1], &runs);
        assert_eq!(
            decision,
            SessionDecision::Reuse {
                session_id: "s-1".to_string(),
                source_phase: "plan".to_string(),
                tokens_used: 20_000,
            }
        );
        assert_eq!(decision.session_id(), Some("s-1"));
    }

    #[test]
    fn test_reuse_denied_above_threshold() {
        let p = policy();
        let config = SessionConfig::default();
        // 0.85 x 130000 = 110500 tokens across runs sharing the session
        let runs = vec![
            run("plan", true, "s-1", 60_000),
            run("implement", false, "s-1", 50_500),
        ];
        let decision = decide(&config, &p, &p.phases[1], &runs);
        match decision {
            SessionDecision::Fresh { reason } => assert!(reason.contains("110500")),
            other => panic!("expected fresh session, got {other:?}"),
        }
    }

    #[test]
    fn test_reuse_uses_most_recent_completed_run() {
        let p = policy();
        let runs = vec![
            run("plan", true, "old", 1_000),
            run("plan", true, "new", 1_000),
            run("plan", false, "broken", 1_000),
        ];
        let decision = decide(&SessionConfig::default(), &p, &p.phases[1], &runs);
        assert_eq!(decision.session_id(), Some("new"));
    }

    #[test]
    fn test_shared_target_uses_latest_completed_any_phase() {
        let p = policy();
        let phase = Phase::new("test").with_session_reuse(SessionTarget::Shared);
        let runs = vec![run("plan", true, "s-plan", 10), run("implement", true, "s-impl", 10)];
        assert_eq!(resolve_target(&p, &phase, &SessionTarget::Shared, &runs).as_deref(), Some("implement"));
        assert_eq!(
            decide(&SessionConfig::default(), &p, &phase, &runs).session_id(),
            Some("s-impl")
        );
    }

    #[test]
    fn test_first_and_self_targets() {
        let p = policy();
        assert_eq!(
            resolve_target(&p, &p.phases[2], &SessionTarget::First, &[]).as_deref(),
            Some("plan")
        );
        assert_eq!(
            resolve_target(&p, &p.phases[2], &SessionTarget::SelfPhase, &[]).as_deref(),
            Some("test")
        );
    }

    #[test]
    fn test_previous_of_first_phase_is_fresh() {
        let p = policy();
        let phase = Phase::new("plan").with_session_reuse(SessionTarget::Previous);
        assert!(matches!(
            decide(&SessionConfig::default(), &p, &phase, &[]),
            SessionDecision::Fresh { .. }
        ));
    }

    #[test]
    fn test_disabled_is_fresh() {
        let p = policy();
        let config = SessionConfig {
            enabled: false,
            ..Default::default()
        };
        let runs = vec![run("plan", true, "s-1", 10)];
        assert!(matches!(
            decide(&config, &p, &p.phases[1], &runs),
            SessionDecision::Fresh { .. }
        ));
    }

    #[test]
    fn test_token_budget() {
        assert_eq!(SessionConfig::default().token_budget(), 104_000);
    }
}
