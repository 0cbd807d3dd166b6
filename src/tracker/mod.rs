//! Issue tracker port.
//!
//! The engine never owns issue storage. It reads ready work and mutates
//! status, priority, labels and notes through [`IssueTracker`]. Two
//! implementations ship with the crate:
//! - [`BeadsTracker`] shells out to the `bd` CLI with `--json`
//! - [`MemoryTracker`] keeps issues in process, for tests and dry runs

pub mod beads;
pub mod labels;
pub mod memory;

pub use beads::BeadsTracker;
pub use labels::{HitlPolicy, LabelConventions};
pub use memory::MemoryTracker;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueStatus::Open => write!(f, "open"),
            IssueStatus::InProgress => write!(f, "in_progress"),
            IssueStatus::Blocked => write!(f, "blocked"),
            IssueStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A work item as seen through the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "issue_type", alias = "type", default = "default_issue_type")]
    pub issue_type: String,
    /// 0 is most urgent
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_issue_type() -> String {
    "task".to_string()
}

fn default_priority() -> u8 {
    2
}

impl Issue {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            issue_type: default_issue_type(),
            priority: default_priority(),
            status: IssueStatus::Open,
            labels: Vec::new(),
        }
    }

    pub fn with_type(mut self, issue_type: impl Into<String>) -> Self {
        self.issue_type = issue_type.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A batch of mutations applied to one issue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueUpdate {
    pub status: Option<IssueStatus>,
    pub priority: Option<u8>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub note: Option<String>,
}

impl IssueUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: IssueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn add_label(mut self, label: impl Into<String>) -> Self {
        self.add_labels.push(label.into());
        self
    }

    pub fn remove_labels(mut self, labels: impl IntoIterator<Item = String>) -> Self {
        self.remove_labels.extend(labels);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.priority.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.note.is_none()
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Open, unblocked issues ordered by urgency.
    async fn ready_work(&self, limit: usize) -> Result<Vec<Issue>>;

    async fn get(&self, id: &str) -> Result<Issue>;

    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_deserializes_beads_shape() {
        let json = r#"{
            "id": "bd-12",
            "title": "Add login",
            "type": "feature",
            "status": "in_progress",
            "priority": 1,
            "labels": ["conductor-managed"]
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.issue_type, "feature");
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert!(issue.has_label("conductor-managed"));
        assert!(issue.description.is_empty());
    }

    #[test]
    fn test_issue_update_builder() {
        let update = IssueUpdate::new()
            .status(IssueStatus::Blocked)
            .add_label("conductor-hitl:max-retries")
            .note("max retries exceeded (3)");
        assert!(!update.is_empty());
        assert_eq!(update.status, Some(IssueStatus::Blocked));
        assert!(IssueUpdate::new().is_empty());
    }

    #[test]
    fn test_issue_status_display() {
        assert_eq!(IssueStatus::InProgress.to_string(), "in_progress");
        assert_eq!(IssueStatus::Blocked.to_string(), "blocked");
    }
}
