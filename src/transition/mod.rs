//! The phase state machine.
//!
//! [`determine`] is a pure function of (policy, phase, input) and always
//! yields the same transition for the same arguments. Retry backoff and
//! phase timeouts are computed here too, but applying them (scheduling a
//! retry, failing a slow outcome) is the worker's job.

use serde::Serialize;
use std::time::Duration;

use crate::outcome::Outcome;
use crate::policy::{BackoffStrategy, DecisionConfig, Phase, Policy, RetryConfig};
use crate::tracker::labels::{HITL_APPROVAL_REQUIRED, HITL_MAX_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Advance,
    Retry,
    Block,
    Close,
    JumpBack,
    DynamicDecision,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Advance => write!(f, "advance"),
            TransitionKind::Retry => write!(f, "retry"),
            TransitionKind::Block => write!(f, "block"),
            TransitionKind::Close => write!(f, "close"),
            TransitionKind::JumpBack => write!(f, "jump_back"),
            TransitionKind::DynamicDecision => write!(f, "dynamic_decision"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub kind: TransitionKind,
    /// Destination for advance and jump_back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<String>,
    pub reason: String,
    /// Back-off before the retried attempt may start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<Duration>,
    /// HITL label reason attached when blocking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_reason: Option<String>,
    /// Decision routing to run for dynamic_decision
    #[serde(skip)]
    pub decision: Option<DecisionConfig>,
}

impl Transition {
    fn base(kind: TransitionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            next_phase: None,
            reason: reason.into(),
            retry_delay: None,
            hitl_reason: None,
            decision: None,
        }
    }

    pub fn advance(next_phase: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut t = Self::base(TransitionKind::Advance, reason);
        t.next_phase = Some(next_phase.into());
        t
    }

    pub fn jump_back(target: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut t = Self::base(TransitionKind::JumpBack, reason);
        t.next_phase = Some(target.into());
        t
    }

    pub fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        let mut t = Self::base(TransitionKind::Retry, reason);
        t.retry_delay = Some(delay);
        t
    }

    pub fn block(reason: impl Into<String>, hitl_reason: impl Into<String>) -> Self {
        let mut t = Self::base(TransitionKind::Block, reason);
        t.hitl_reason = Some(hitl_reason.into());
        t
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Self::base(TransitionKind::Close, reason)
    }

    pub fn dynamic(decision: DecisionConfig) -> Self {
        let mut t = Self::base(
            TransitionKind::DynamicDecision,
            format!("routing deferred to '{}' decision agent", decision.capability),
        );
        t.decision = Some(decision);
        t
    }

    pub fn is_block(&self) -> bool {
        self.kind == TransitionKind::Block
    }
}

/// What the engine needs to know about a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionInput {
    pub success: bool,
    /// Failed attempts of this phase before the current one
    pub retry_count: u32,
    /// The outcome itself asked for approval
    pub requires_approval: bool,
    /// A human already approved this phase, lifting the phase-level gate
    pub approval_granted: bool,
}

impl TransitionInput {
    pub fn from_outcome(outcome: &Outcome, retry_count: u32) -> Self {
        Self {
            success: outcome.success,
            retry_count,
            requires_approval: outcome.requires_approval,
            approval_granted: false,
        }
    }

    pub fn with_approval_granted(mut self, granted: bool) -> Self {
        self.approval_granted = granted;
        self
    }
}

/// Decide what happens after an attempt of `phase` under `policy`.
pub fn determine(policy: &Policy, phase: &Phase, input: TransitionInput) -> Transition {
    let phase_gate = phase.require_approval && !input.approval_granted;
    if input.requires_approval || phase_gate {
        return Transition::block("approval required", HITL_APPROVAL_REQUIRED);
    }

    if let Some(decision) = &phase.decision
        && decision.trigger.fires_on(input.success)
    {
        return Transition::dynamic(decision.clone());
    }

    if input.success {
        return match policy.next_phase(&phase.name) {
            Some(next) => Transition::advance(
                next.name.clone(),
                format!("phase '{}' completed", phase.name),
            ),
            None => Transition::close("all phases completed"),
        };
    }

    let max_attempts = policy.retry.max_attempts;
    if input.retry_count < max_attempts.saturating_sub(1) {
        let delay = retry_delay(&policy.retry, input.retry_count);
        Transition::retry(
            delay,
            format!(
                "attempt {} of {} failed, retrying in {}ms",
                input.retry_count + 1,
                max_attempts,
                delay.as_millis()
            ),
        )
    } else {
        Transition::block(
            format!("max retries exceeded ({})", max_attempts),
            HITL_MAX_RETRIES,
        )
    }
}

/// Delay before retry number `attempt` (0-based), clamped to `[initial, max]`.
pub fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let initial = retry.initial_delay_ms;
    let raw = match retry.backoff_strategy {
        BackoffStrategy::Exponential => {
            let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
            initial.saturating_mul(factor)
        }
        BackoffStrategy::Linear => initial.saturating_mul(u64::from(attempt) + 1),
        BackoffStrategy::Fixed => initial,
    };
    let max = retry.max_delay_ms.max(initial);
    Duration::from_millis(raw.clamp(initial, max))
}

/// Time budget for one attempt of `phase`.
pub fn phase_timeout(policy: &Policy, phase: &Phase) -> Duration {
    let ms = policy.timeout_base_ms as f64 * phase.timeout_multiplier;
    Duration::from_millis(ms.round() as u64)
}

/// Fail `outcome` if it ran longer than `limit`. Returns whether it was exceeded.
pub fn enforce_timeout(outcome: &mut Outcome, limit: Duration) -> bool {
    let limit_ms = limit.as_millis() as u64;
    if outcome.metrics.duration_ms <= limit_ms {
        return false;
    }
    outcome.mark_failed(
        "timeout",
        format!(
            "phase attempt took {}ms, exceeding its {}ms timeout",
            outcome.metrics.duration_ms, limit_ms
        ),
    );
    if let Some(error) = outcome.error.as_mut() {
        error.details = Some(serde_json::json!({
            "duration_ms": outcome.metrics.duration_ms,
            "timeout_ms": limit_ms,
        }));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DecisionTrigger, RetryConfig};

    fn policy() -> Policy {
        Policy::new(
            "feature",
            vec![Phase::new("plan"), Phase::new("implement"), Phase::new("test")],
        )
    }

    fn input(success: bool, retry_count: u32) -> TransitionInput {
        TransitionInput {
            success,
            retry_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_success_advances_then_closes() {
        let p = policy();
        let t = determine(&p, &p.phases[0], input(true, 0));
        assert_eq!(t.kind, TransitionKind::Advance);
        assert_eq!(t.next_phase.as_deref(), Some("implement"));

        let last = p.phases.last().unwrap();
        let t = determine(&p, last, input(true, 0));
        assert_eq!(t.kind, TransitionKind::Close);
        assert_eq!(t.reason, "all phases completed");
        assert!(p.next_phase(&last.name).is_none());
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let p = policy();
        let phase = &p.phases[1];
        assert_eq!(determine(&p, phase, input(false, 0)).kind, TransitionKind::Retry);
        assert_eq!(determine(&p, phase, input(false, 1)).kind, TransitionKind::Retry);
        let t = determine(&p, phase, input(false, 2));
        assert_eq!(t.kind, TransitionKind::Block);
        assert_eq!(t.reason, "max retries exceeded (3)");
        assert_eq!(t.hitl_reason.as_deref(), Some(HITL_MAX_RETRIES));
    }

    #[test]
    fn test_single_attempt_blocks_immediately() {
        let p = policy().with_retry(RetryConfig {
            max_attempts: 1,
            ..Default::default()
        });
        let t = determine(&p, &p.phases[0], input(false, 0));
        assert_eq!(t.kind, TransitionKind::Block);
    }

    #[test]
    fn test_determine_is_deterministic() {
        let p = policy();
        for (success, retries) in [(true, 0), (false, 0), (false, 2), (true, 5)] {
            let a = determine(&p, &p.phases[1], input(success, retries));
            let b = determine(&p, &p.phases[1], input(success, retries));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_approval_checked_before_outcome() {
        let mut p = policy();
        p.phases[0] = Phase::new("plan").with_approval();

        let t = determine(&p, &p.phases[0], input(true, 0));
        assert_eq!(t.kind, TransitionKind::Block);
        assert_eq!(t.reason, "approval required");

        // Also wins over failure handling
        let t = determine(&p, &p.phases[0], input(false, 0));
        assert_eq!(t.kind, TransitionKind::Block);

        // Outcome-requested approval applies to ungated phases
        let mut req = input(true, 0);
        req.requires_approval = true;
        assert!(determine(&p, &p.phases[1], req).is_block());
    }

    #[test]
    fn test_granted_approval_lifts_phase_gate_only() {
        let mut p = policy();
        p.phases[0] = Phase::new("plan").with_approval();
        let granted = input(true, 0).with_approval_granted(true);
        assert_eq!(determine(&p, &p.phases[0], granted).kind, TransitionKind::Advance);

        let mut asked = granted;
        asked.requires_approval = true;
        assert!(determine(&p, &p.phases[0], asked).is_block());
    }

    #[test]
    fn test_decision_phase_defers() {
        let mut p = policy();
        p.phases[2] = Phase::new("test").with_decision(DecisionConfig::default());
        let t = determine(&p, &p.phases[2], input(true, 0));
        assert_eq!(t.kind, TransitionKind::DynamicDecision);
        assert!(t.decision.is_some());

        // Default trigger is success only; failures still retry
        let t = determine(&p, &p.phases[2], input(false, 0));
        assert_eq!(t.kind, TransitionKind::Retry);

        p.phases[2] = Phase::new("test")
            .with_decision(DecisionConfig::default().with_trigger(DecisionTrigger::Failure));
        assert_eq!(
            determine(&p, &p.phases[2], input(false, 0)).kind,
            TransitionKind::DynamicDecision
        );
        assert_eq!(determine(&p, &p.phases[2], input(true, 0)).kind, TransitionKind::Close);
    }

    #[test]
    fn test_exponential_backoff() {
        let retry = RetryConfig {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 5000,
            max_delay_ms: 300_000,
        };
        assert_eq!(retry_delay(&retry, 0), Duration::from_millis(5000));
        assert_eq!(retry_delay(&retry, 3), Duration::from_millis(40_000));
        assert_eq!(retry_delay(&retry, 10), Duration::from_millis(300_000));
        assert_eq!(retry_delay(&retry, 200), Duration::from_millis(300_000));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let mut retry = RetryConfig {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Linear,
            initial_delay_ms: 1000,
            max_delay_ms: 2500,
        };
        assert_eq!(retry_delay(&retry, 0), Duration::from_millis(1000));
        assert_eq!(retry_delay(&retry, 1), Duration::from_millis(2000));
        assert_eq!(retry_delay(&retry, 4), Duration::from_millis(2500));

        retry.backoff_strategy = BackoffStrategy::Fixed;
        assert_eq!(retry_delay(&retry, 7), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_transition_carries_delay() {
        let p = policy();
        let t = determine(&p, &p.phases[0], input(false, 1));
        assert_eq!(t.retry_delay, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn test_phase_timeout_uses_multiplier() {
        let p = policy().with_timeout_base_ms(60_000);
        let slow = Phase::new("implement").with_timeout_multiplier(2.5);
        assert_eq!(phase_timeout(&p, &p.phases[0]), Duration::from_millis(60_000));
        assert_eq!(phase_timeout(&p, &slow), Duration::from_millis(150_000));
    }

    #[test]
    fn test_enforce_timeout_is_retroactive() {
        let mut outcome = Outcome::success("done").with_duration_ms(61_000);
        assert!(enforce_timeout(&mut outcome, Duration::from_secs(60)));
        assert!(!outcome.success);
        assert_eq!(outcome.error_type(), Some("timeout"));
        assert_eq!(outcome.error.as_ref().unwrap().details.as_ref().unwrap()["timeout_ms"], 60_000);

        let mut fast = Outcome::success("done").with_duration_ms(60_000);
        assert!(!enforce_timeout(&mut fast, Duration::from_secs(60)));
        assert!(fast.success);
    }
}
