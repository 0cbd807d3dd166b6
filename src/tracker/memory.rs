//! In-process issue tracker.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{Issue, IssueStatus, IssueTracker, IssueUpdate};
use crate::errors::TrackerError;

/// Keeps issues in memory. Used by tests and `--dry-run`.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    issues: Mutex<BTreeMap<String, Issue>>,
    notes: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issues(issues: Vec<Issue>) -> Self {
        let tracker = Self::new();
        for issue in issues {
            tracker.insert(issue);
        }
        tracker
    }

    pub fn insert(&self, issue: Issue) {
        if let Ok(mut issues) = self.issues.lock() {
            issues.insert(issue.id.clone(), issue);
        }
    }

    /// Current state of an issue, outside the async port.
    pub fn snapshot(&self, id: &str) -> Option<Issue> {
        self.issues.lock().ok()?.get(id).cloned()
    }

    pub fn notes(&self, id: &str) -> Vec<String> {
        self.notes
            .lock()
            .ok()
            .and_then(|n| n.get(id).cloned())
            .unwrap_or_default()
    }

    /// Mimic a human reopening an issue, optionally swapping labels.
    pub fn reopen(&self, id: &str, add: &[&str], remove: &[&str]) {
        if let Ok(mut issues) = self.issues.lock()
            && let Some(issue) = issues.get_mut(id)
        {
            issue.status = IssueStatus::Open;
            issue.labels.retain(|l| !remove.contains(&l.as_str()));
            for label in add {
                if !issue.has_label(label) {
                    issue.labels.push(label.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    async fn ready_work(&self, limit: usize) -> Result<Vec<Issue>> {
        let issues = self
            .issues
            .lock()
            .map_err(|_| anyhow!("issue store lock poisoned"))?;
        let mut ready: Vec<Issue> = issues
            .values()
            .filter(|i| i.status == IssueStatus::Open)
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn get(&self, id: &str) -> Result<Issue> {
        let issues = self
            .issues
            .lock()
            .map_err(|_| anyhow!("issue store lock poisoned"))?;
        issues
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::IssueNotFound { id: id.to_string() }.into())
    }

    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()> {
        let mut issues = self
            .issues
            .lock()
            .map_err(|_| anyhow!("issue store lock poisoned"))?;
        let issue = issues
            .get_mut(id)
            .ok_or_else(|| TrackerError::IssueNotFound { id: id.to_string() })?;

        if let Some(status) = update.status {
            issue.status = status;
        }
        if let Some(priority) = update.priority {
            issue.priority = priority;
        }
        issue.labels.retain(|l| !update.remove_labels.contains(l));
        for label in update.add_labels {
            if !issue.has_label(&label) {
                issue.labels.push(label);
            }
        }
        drop(issues);

        if let Some(note) = update.note {
            let mut notes = self
                .notes
                .lock()
                .map_err(|_| anyhow!("note store lock poisoned"))?;
            notes.entry(id.to_string()).or_default().push(note);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_work_orders_by_priority() {
        let tracker = MemoryTracker::with_issues(vec![
            Issue::new("bd-2", "later").with_priority(3),
            Issue::new("bd-1", "urgent").with_priority(0),
            Issue::new("bd-3", "done").with_priority(0),
        ]);
        tracker
            .update("bd-3", IssueUpdate::new().status(IssueStatus::Closed))
            .await
            .unwrap();

        let ready = tracker.ready_work(10).await.unwrap();
        let ids: Vec<_> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-1", "bd-2"]);
        assert_eq!(tracker.ready_work(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_labels_and_notes() {
        let tracker = MemoryTracker::with_issues(vec![
            Issue::new("bd-1", "x").with_labels(&["conductor-phase:plan"]),
        ]);
        tracker
            .update(
                "bd-1",
                IssueUpdate::new()
                    .remove_labels(vec!["conductor-phase:plan".to_string()])
                    .add_label("conductor-phase:implement")
                    .note("advanced"),
            )
            .await
            .unwrap();

        let issue = tracker.get("bd-1").await.unwrap();
        assert_eq!(issue.labels, vec!["conductor-phase:implement"]);
        assert_eq!(tracker.notes("bd-1"), vec!["advanced"]);
    }

    #[tokio::test]
    async fn test_get_missing_issue() {
        let tracker = MemoryTracker::new();
        let err = tracker.get("bd-404").await.unwrap_err();
        assert!(err.to_string().contains("bd-404"));
    }

    #[test]
    fn test_reopen_swaps_labels() {
        let mut issue = Issue::new("bd-1", "x").with_labels(&["conductor-hitl:approval-required"]);
        issue.status = IssueStatus::Blocked;
        let tracker = MemoryTracker::with_issues(vec![issue]);
        tracker.reopen(
            "bd-1",
            &["conductor-approved:review"],
            &["conductor-hitl:approval-required"],
        );
        let issue = tracker.snapshot("bd-1").unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.labels, vec!["conductor-approved:review"]);
    }
}
