//! Applying a transition to the external issue.
//!
//! | kind        | status      | labels                                          |
//! |-------------|-------------|-------------------------------------------------|
//! | advance     | open        | phase -> next, clear hitl + approvals           |
//! | jump_back   | open        | phase -> target, clear hitl + approvals         |
//! | retry       | open        | clear hitl, keep phase                          |
//! | block       | blocked     | hitl reason when required, approval instructions |
//! | close       | closed      | strip every engine-owned label                  |

use anyhow::{Result, bail};

use crate::policy::{Phase, Policy};
use crate::tracker::labels::HITL_APPROVAL_REQUIRED;
use crate::tracker::{HitlPolicy, IssueStatus, IssueUpdate, LabelConventions};
use crate::transition::{Transition, TransitionKind};

/// Tracker mutation for `transition`, given the issue's current labels.
pub fn issue_update(
    labels: &LabelConventions,
    hitl: &HitlPolicy,
    current: &[String],
    policy: &Policy,
    phase: &Phase,
    transition: &Transition,
) -> Result<IssueUpdate> {
    let update = match transition.kind {
        TransitionKind::Advance | TransitionKind::JumpBack => {
            let Some(target) = transition.next_phase.as_deref() else {
                bail!("{} transition without a target phase", transition.kind);
            };
            let mut stale = labels.phase_labels(current);
            stale.extend(labels.hitl_labels(current));
            stale.extend(labels.approval_labels(current));
            let next = labels.phase(target);
            stale.retain(|l| *l != next);
            IssueUpdate::new()
                .status(IssueStatus::Open)
                .remove_labels(stale)
                .add_label(next)
                .note(format!("{} -> {}: {}", phase.name, target, transition.reason))
        }
        TransitionKind::Retry => IssueUpdate::new()
            .status(IssueStatus::Open)
            .remove_labels(labels.hitl_labels(current))
            .note(format!("retrying {}: {}", phase.name, transition.reason)),
        TransitionKind::Block => {
            let reason = transition.hitl_reason.as_deref().unwrap_or_default();
            let approval = reason == HITL_APPROVAL_REQUIRED;
            let mut update = IssueUpdate::new()
                .status(IssueStatus::Blocked)
                .remove_labels(labels.hitl_labels(current));
            if approval || policy.require_hitl {
                update = update.add_label(labels.hitl(hitl.sanitize(reason)));
            }
            let mut note = format!("blocked in {}: {}", phase.name, transition.reason);
            if approval {
                note.push_str(&format!(
                    "\nTo approve, add the label '{}' and reopen the issue.",
                    labels.approved(&phase.name)
                ));
            }
            update.note(note)
        }
        TransitionKind::Close => IssueUpdate::new()
            .status(IssueStatus::Closed)
            .remove_labels(labels.tracking_labels(current))
            .note(transition.reason.clone()),
        TransitionKind::DynamicDecision => {
            bail!("dynamic_decision must be resolved before it is applied")
        }
    };
    Ok(update)
}
