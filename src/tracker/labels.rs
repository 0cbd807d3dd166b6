//! Label conventions owned by the engine.
//!
//! | Label                        | Owner  | Meaning                                |
//! |------------------------------|--------|----------------------------------------|
//! | `<prefix>-managed`           | engine | issue has been picked up at least once |
//! | `<prefix>-phase:<name>`      | engine | current phase                          |
//! | `<prefix>-hitl:<reason>`     | engine | blocked, waiting for a human           |
//! | `<prefix>-approved:<phase>`  | human  | approval granted for a gated phase     |
//! | `<prefix>-excluded`          | human  | never pick this issue up               |
//! | `<prefix>-workflow:<name>`   | human  | explicit policy override               |

use regex::Regex;

use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConventions {
    prefix: String,
}

impl LabelConventions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn managed(&self) -> String {
        format!("{}-managed", self.prefix)
    }

    pub fn excluded(&self) -> String {
        format!("{}-excluded", self.prefix)
    }

    pub fn phase(&self, name: &str) -> String {
        format!("{}-phase:{}", self.prefix, name)
    }

    pub fn hitl(&self, reason: &str) -> String {
        format!("{}-hitl:{}", self.prefix, reason)
    }

    pub fn approved(&self, phase: &str) -> String {
        format!("{}-approved:{}", self.prefix, phase)
    }

    pub fn workflow(&self, policy: &str) -> String {
        format!("{}-workflow:{}", self.prefix, policy)
    }

    fn value<'a>(&self, labels: &'a [String], kind: &str) -> Option<&'a str> {
        let marker = format!("{}-{}:", self.prefix, kind);
        labels
            .iter()
            .find_map(|l| l.strip_prefix(marker.as_str()))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn all_of(&self, labels: &[String], kind: &str) -> Vec<String> {
        let marker = format!("{}-{}:", self.prefix, kind);
        labels
            .iter()
            .filter(|l| l.starts_with(marker.as_str()))
            .cloned()
            .collect()
    }

    /// Phase named by the issue's phase label, if any.
    pub fn current_phase<'a>(&self, labels: &'a [String]) -> Option<&'a str> {
        self.value(labels, "phase")
    }

    pub fn workflow_override<'a>(&self, labels: &'a [String]) -> Option<&'a str> {
        self.value(labels, "workflow")
    }

    pub fn hitl_reason<'a>(&self, labels: &'a [String]) -> Option<&'a str> {
        self.value(labels, "hitl")
    }

    pub fn is_excluded(&self, labels: &[String]) -> bool {
        let excluded = self.excluded();
        labels.iter().any(|l| *l == excluded)
    }

    pub fn is_managed(&self, labels: &[String]) -> bool {
        let managed = self.managed();
        labels.iter().any(|l| *l == managed)
    }

    pub fn is_approved(&self, labels: &[String], phase: &str) -> bool {
        let approved = self.approved(phase);
        labels.iter().any(|l| *l == approved)
    }

    pub fn phase_labels(&self, labels: &[String]) -> Vec<String> {
        self.all_of(labels, "phase")
    }

    pub fn hitl_labels(&self, labels: &[String]) -> Vec<String> {
        self.all_of(labels, "hitl")
    }

    pub fn approval_labels(&self, labels: &[String]) -> Vec<String> {
        self.all_of(labels, "approved")
    }

    /// Every engine-owned label present. User-owned override and exclusion labels are kept.
    pub fn tracking_labels(&self, labels: &[String]) -> Vec<String> {
        let managed = self.managed();
        let mut out: Vec<String> = labels.iter().filter(|l| **l == managed).cloned().collect();
        out.extend(self.phase_labels(labels));
        out.extend(self.hitl_labels(labels));
        out.extend(self.approval_labels(labels));
        out
    }
}

/// Validates HITL reasons against an allow-list plus an optional pattern.
#[derive(Debug, Clone)]
pub struct HitlPolicy {
    allowed: Vec<String>,
    pattern: Option<Regex>,
    fallback: String,
}

pub const HITL_APPROVAL_REQUIRED: &str = "approval-required";
pub const HITL_MAX_RETRIES: &str = "max-retries";
pub const HITL_DECISION_BLOCKED: &str = "decision-blocked";
pub const HITL_ASSISTANT_BLOCKED: &str = "assistant-blocked";
pub const HITL_NEEDS_HUMAN: &str = "needs-human";

pub fn default_hitl_reasons() -> Vec<String> {
    [
        HITL_APPROVAL_REQUIRED,
        HITL_MAX_RETRIES,
        HITL_DECISION_BLOCKED,
        HITL_ASSISTANT_BLOCKED,
        HITL_NEEDS_HUMAN,
    ]
    .iter()
    .map(|r| r.to_string())
    .collect()
}

impl Default for HitlPolicy {
    fn default() -> Self {
        Self {
            allowed: default_hitl_reasons(),
            pattern: None,
            fallback: HITL_NEEDS_HUMAN.to_string(),
        }
    }
}

impl HitlPolicy {
    pub fn new(allowed: Vec<String>, pattern: Option<&str>) -> Result<Self, ConfigError> {
        let pattern = match pattern {
            Some(p) => Some(Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                pattern: p.to_string(),
                source,
            })?),
            None => None,
        };
        Ok(Self {
            allowed,
            pattern,
            fallback: HITL_NEEDS_HUMAN.to_string(),
        })
    }

    pub fn is_valid(&self, reason: &str) -> bool {
        if reason.is_empty() || reason.contains(char::is_whitespace) {
            return false;
        }
        self.allowed.iter().any(|r| r == reason)
            || self.pattern.as_ref().is_some_and(|p| p.is_match(reason))
    }

    /// `reason` when valid, otherwise the generic fallback reason.
    pub fn sanitize<'a>(&'a self, reason: &'a str) -> &'a str {
        if self.is_valid(reason) {
            reason
        } else {
            tracing::warn!(reason = %reason, fallback = %self.fallback, "HITL reason rejected");
            &self.fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_label_formats() {
        let conv = LabelConventions::new("conductor");
        assert_eq!(conv.managed(), "conductor-managed");
        assert_eq!(conv.phase("plan"), "conductor-phase:plan");
        assert_eq!(conv.hitl("max-retries"), "conductor-hitl:max-retries");
        assert_eq!(conv.approved("review"), "conductor-approved:review");
        assert_eq!(conv.workflow("hotfix"), "conductor-workflow:hotfix");
    }

    #[test]
    fn test_current_phase_and_override() {
        let conv = LabelConventions::new("conductor");
        let l = labels(&["bug", "conductor-phase:implement", "conductor-workflow:hotfix"]);
        assert_eq!(conv.current_phase(&l), Some("implement"));
        assert_eq!(conv.workflow_override(&l), Some("hotfix"));
        assert_eq!(conv.current_phase(&labels(&["conductor-phase:"])), None);
    }

    #[test]
    fn test_other_prefix_is_ignored() {
        let conv = LabelConventions::new("conductor");
        let l = labels(&["other-phase:plan", "other-excluded"]);
        assert_eq!(conv.current_phase(&l), None);
        assert!(!conv.is_excluded(&l));
    }

    #[test]
    fn test_tracking_labels_keep_user_owned() {
        let conv = LabelConventions::new("conductor");
        let l = labels(&[
            "conductor-managed",
            "conductor-phase:test",
            "conductor-hitl:max-retries",
            "conductor-approved:review",
            "conductor-workflow:hotfix",
            "conductor-excluded",
            "bug",
        ]);
        let tracking = conv.tracking_labels(&l);
        assert_eq!(tracking.len(), 4);
        assert!(!tracking.contains(&"conductor-workflow:hotfix".to_string()));
        assert!(!tracking.contains(&"bug".to_string()));
    }

    #[test]
    fn test_hitl_policy_allow_list_and_pattern() {
        let policy = HitlPolicy::new(default_hitl_reasons(), Some(r"^security-[a-z]+$")).unwrap();
        assert!(policy.is_valid("max-retries"));
        assert!(policy.is_valid("security-review"));
        assert!(!policy.is_valid("security review"));
        assert!(!policy.is_valid("whatever"));
        assert_eq!(policy.sanitize("whatever"), HITL_NEEDS_HUMAN);
        assert_eq!(policy.sanitize("approval-required"), "approval-required");
    }

    #[test]
    fn test_hitl_policy_invalid_pattern() {
        let err = HitlPolicy::new(vec![], Some("(unclosed")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
