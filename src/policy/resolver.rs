//! Maps an issue to the policy that should drive it.
//!
//! Precedence: explicit `<prefix>-workflow:<name>` label, then issue-type
//! match ordered by policy priority (declaration order breaks ties), then the
//! store's default policy.

use serde::{Deserialize, Serialize};

use super::PolicyStore;
use crate::errors::ResolveError;
use crate::tracker::{Issue, LabelConventions};

/// What to do when a workflow override label names an unknown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStrategy {
    /// Fail the issue attempt
    #[default]
    Error,
    /// Log and fall through to type matching
    Warning,
    /// Silently fall through to type matching
    Ignore,
}

impl std::fmt::Display for OverrideStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideStrategy::Error => write!(f, "error"),
            OverrideStrategy::Warning => write!(f, "warning"),
            OverrideStrategy::Ignore => write!(f, "ignore"),
        }
    }
}

/// Which rule produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Override,
    IssueType,
    Default,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionSource::Override => write!(f, "override label"),
            ResolutionSource::IssueType => write!(f, "issue type"),
            ResolutionSource::Default => write!(f, "default policy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub policy: String,
    pub source: ResolutionSource,
    /// Set when an invalid override was skipped under the `warning` strategy
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyResolver {
    labels: LabelConventions,
    strategy: OverrideStrategy,
}

impl PolicyResolver {
    pub fn new(labels: LabelConventions, strategy: OverrideStrategy) -> Self {
        Self { labels, strategy }
    }

    pub fn strategy(&self) -> OverrideStrategy {
        self.strategy
    }

    pub fn labels(&self) -> &LabelConventions {
        &self.labels
    }

    /// Resolve `issue` to a policy name. Only the `error` override strategy can fail.
    pub fn resolve(&self, store: &PolicyStore, issue: &Issue) -> Result<Resolution, ResolveError> {
        let mut warning = None;

        if let Some(requested) = self.labels.workflow_override(&issue.labels) {
            if store.contains(requested) {
                return Ok(Resolution {
                    policy: requested.to_string(),
                    source: ResolutionSource::Override,
                    warning: None,
                });
            }
            match self.strategy {
                OverrideStrategy::Error => {
                    return Err(ResolveError::UnknownWorkflowOverride {
                        issue: issue.id.clone(),
                        policy: requested.to_string(),
                    });
                }
                OverrideStrategy::Warning => {
                    let msg = format!(
                        "issue {} requests unknown workflow '{}', falling back",
                        issue.id, requested
                    );
                    tracing::warn!(issue = %issue.id, workflow = %requested, "unknown workflow override, falling back");
                    warning = Some(msg);
                }
                OverrideStrategy::Ignore => {}
            }
        }

        // Stable sort keeps declaration order among equal priorities.
        let mut matches: Vec<_> = store
            .policies()
            .iter()
            .filter(|p| p.matches_issue_type(&issue.issue_type))
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(best) = matches.first() {
            return Ok(Resolution {
                policy: best.name.clone(),
                source: ResolutionSource::IssueType,
                warning,
            });
        }

        Ok(Resolution {
            policy: store.default_policy_name().to_string(),
            source: ResolutionSource::Default,
            warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Phase, Policy};

    fn store() -> PolicyStore {
        PolicyStore::new(
            vec![
                Policy::new("hotfix", vec![Phase::new("fix")])
                    .with_issue_types(&["bug"])
                    .with_priority(50),
                Policy::new("default", vec![Phase::new("work")])
                    .with_issue_types(&["bug"])
                    .with_priority(50),
                Policy::new("feature", vec![Phase::new("plan"), Phase::new("implement")])
                    .with_issue_types(&["feature"])
                    .with_priority(10),
                Policy::new("big-feature", vec![Phase::new("design")])
                    .with_issue_types(&["feature"])
                    .with_priority(90),
            ],
            "default",
        )
        .unwrap()
    }

    fn resolver(strategy: OverrideStrategy) -> PolicyResolver {
        PolicyResolver::new(LabelConventions::new("conductor"), strategy)
    }

    #[test]
    fn test_equal_priority_uses_declaration_order() {
        let issue = Issue::new("bd-1", "crash on start").with_type("bug");
        let res = resolver(OverrideStrategy::Error)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "hotfix");
        assert_eq!(res.source, ResolutionSource::IssueType);
    }

    #[test]
    fn test_higher_priority_wins() {
        let issue = Issue::new("bd-2", "new dashboard").with_type("feature");
        let res = resolver(OverrideStrategy::Error)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "big-feature");
    }

    #[test]
    fn test_falls_back_to_default() {
        let issue = Issue::new("bd-3", "update docs").with_type("chore");
        let res = resolver(OverrideStrategy::Error)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "default");
        assert_eq!(res.source, ResolutionSource::Default);
    }

    #[test]
    fn test_override_label_wins() {
        let issue = Issue::new("bd-4", "crash")
            .with_type("bug")
            .with_labels(&["conductor-workflow:feature"]);
        let res = resolver(OverrideStrategy::Error)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "feature");
        assert_eq!(res.source, ResolutionSource::Override);
    }

    #[test]
    fn test_unknown_override_error_strategy() {
        let issue = Issue::new("bd-5", "crash")
            .with_type("bug")
            .with_labels(&["conductor-workflow:nope"]);
        let err = resolver(OverrideStrategy::Error)
            .resolve(&store(), &issue)
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownWorkflowOverride { .. }));
    }

    #[test]
    fn test_unknown_override_warning_strategy_falls_through() {
        let issue = Issue::new("bd-6", "crash")
            .with_type("bug")
            .with_labels(&["conductor-workflow:nope"]);
        let res = resolver(OverrideStrategy::Warning)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "hotfix");
        assert!(res.warning.unwrap().contains("nope"));
    }

    #[test]
    fn test_unknown_override_ignore_strategy_is_silent() {
        let issue = Issue::new("bd-7", "chore")
            .with_type("chore")
            .with_labels(&["conductor-workflow:nope"]);
        let res = resolver(OverrideStrategy::Ignore)
            .resolve(&store(), &issue)
            .unwrap();
        assert_eq!(res.policy, "default");
        assert!(res.warning.is_none());
    }
}
