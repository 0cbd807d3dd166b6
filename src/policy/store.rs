//! Validated, immutable collection of policies.

use std::collections::HashSet;

use super::{Policy, SessionTarget};
use crate::errors::ConfigError;

/// Named policies in declaration order plus the default policy name.
///
/// Construction validates every structural invariant, so lookups on a built
/// store never have to deal with malformed policies.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    policies: Vec<Policy>,
    default_policy: String,
}

impl PolicyStore {
    pub fn new(policies: Vec<Policy>, default_policy: impl Into<String>) -> Result<Self, ConfigError> {
        let default_policy = default_policy.into();
        if policies.is_empty() {
            return Err(ConfigError::NoPolicies);
        }

        let mut seen = HashSet::new();
        for policy in &policies {
            if !seen.insert(policy.name.as_str()) {
                return Err(ConfigError::DuplicatePolicy {
                    name: policy.name.clone(),
                });
            }
            validate_policy(policy)?;
        }

        if !seen.contains(default_policy.as_str()) {
            return Err(ConfigError::UnknownDefaultPolicy {
                name: default_policy,
            });
        }

        Ok(Self {
            policies,
            default_policy,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn default_policy_name(&self) -> &str {
        &self.default_policy
    }

    pub fn default_policy(&self) -> &Policy {
        // Presence is checked in `new`.
        self.get(&self.default_policy)
            .unwrap_or(&self.policies[0])
    }

    /// Policies in declaration order.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name.as_str()).collect()
    }
}

fn validate_policy(policy: &Policy) -> Result<(), ConfigError> {
    if policy.phases.is_empty() {
        return Err(ConfigError::EmptyPhases {
            policy: policy.name.clone(),
        });
    }

    let mut phase_names = HashSet::new();
    for phase in &policy.phases {
        if !phase_names.insert(phase.name.as_str()) {
            return Err(ConfigError::DuplicatePhase {
                policy: policy.name.clone(),
                phase: phase.name.clone(),
            });
        }
    }

    if policy.retry.max_attempts == 0 {
        return Err(invalid(
            format!("policies.{}.retry.max_attempts", policy.name),
            "must be at least 1",
        ));
    }
    if policy.retry.initial_delay_ms > policy.retry.max_delay_ms {
        return Err(invalid(
            format!("policies.{}.retry", policy.name),
            "initial_delay_ms must not exceed max_delay_ms",
        ));
    }
    if policy.timeout_base_ms == 0 {
        return Err(invalid(
            format!("policies.{}.timeout_base_ms", policy.name),
            "must be greater than 0",
        ));
    }

    for phase in &policy.phases {
        if !(phase.timeout_multiplier.is_finite() && phase.timeout_multiplier > 0.0) {
            return Err(invalid(
                format!("policies.{}.phases.{}.timeout_multiplier", policy.name, phase.name),
                "must be a positive number",
            ));
        }

        if let Some(SessionTarget::Phase(target)) = &phase.reuse_session
            && !phase_names.contains(target.as_str())
        {
            return Err(ConfigError::UnknownPhaseReference {
                policy: policy.name.clone(),
                phase: phase.name.clone(),
                target: target.clone(),
            });
        }

        if let Some(decision) = &phase.decision {
            for dest in &decision.allowed_destinations {
                if !phase_names.contains(dest.as_str()) {
                    return Err(ConfigError::UnknownPhaseReference {
                        policy: policy.name.clone(),
                        phase: phase.name.clone(),
                        target: dest.clone(),
                    });
                }
            }
            let threshold = decision.thresholds.require_approval;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(invalid(
                    format!(
                        "policies.{}.phases.{}.decision.thresholds.require_approval",
                        policy.name, phase.name
                    ),
                    "must be between 0.0 and 1.0",
                ));
            }
            if decision.capability.trim().is_empty() {
                return Err(invalid(
                    format!("policies.{}.phases.{}.decision.capability", policy.name, phase.name),
                    "must not be empty",
                ));
            }
        }
    }

    Ok(())
}

fn invalid(field: String, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.to_string(),
    }
}
