//! Inter-phase messenger.
//!
//! Phases leave messages for later phases of the same issue. The worker
//! emits a `result` message on every advance and delivers unread messages
//! to a phase before dispatching it.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Context,
    Result,
    Decision,
    Data,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Context => write!(f, "context"),
            MessageType::Result => write!(f, "result"),
            MessageType::Decision => write!(f, "decision"),
            MessageType::Data => write!(f, "data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMessage {
    pub id: String,
    pub issue_id: String,
    pub from_phase: String,
    pub to_phase: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl PhaseMessage {
    pub fn new(
        issue_id: &str,
        from_phase: &str,
        to_phase: &str,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            issue_id: issue_id.to_string(),
            from_phase: from_phase.to_string(),
            to_phase: to_phase.to_string(),
            message_type,
            content: content.into(),
            metadata: Value::Null,
            created_at: Utc::now(),
            read: false,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, message: PhaseMessage) -> Result<()>;

    /// Unread messages for `phase` of `issue_id`, oldest first.
    async fn receive(&self, issue_id: &str, phase: &str, mark_as_read: bool) -> Result<Vec<PhaseMessage>>;
}

fn take_unread(messages: &mut [PhaseMessage], issue_id: &str, phase: &str, mark: bool) -> Vec<PhaseMessage> {
    let mut out = Vec::new();
    for msg in messages
        .iter_mut()
        .filter(|m| !m.read && m.issue_id == issue_id && m.to_phase == phase)
    {
        out.push(msg.clone());
        if mark {
            msg.read = true;
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct MemoryMessenger {
    messages: Mutex<Vec<PhaseMessage>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<PhaseMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send(&self, message: PhaseMessage) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| anyhow!("messenger lock poisoned"))?
            .push(message);
        Ok(())
    }

    async fn receive(&self, issue_id: &str, phase: &str, mark_as_read: bool) -> Result<Vec<PhaseMessage>> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| anyhow!("messenger lock poisoned"))?;
        Ok(take_unread(&mut messages, issue_id, phase, mark_as_read))
    }
}

/// One JSON file per issue under the messages directory.
pub struct FileMessenger {
    dir: PathBuf,
    // Serializes read-modify-write of the per-issue files.
    guard: Mutex<()>,
}

impl FileMessenger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    fn issue_file(&self, issue_id: &str) -> PathBuf {
        let safe: String = issue_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn load(path: &Path) -> Result<Vec<PhaseMessage>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn store(path: &Path, messages: &[PhaseMessage]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(messages).context("Failed to serialize messages")?;
        // Write-then-rename so readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("Failed to open {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
    }
}

#[async_trait]
impl Messenger for FileMessenger {
    async fn send(&self, message: PhaseMessage) -> Result<()> {
        let _guard = self.guard.lock().map_err(|_| anyhow!("messenger lock poisoned"))?;
        let path = self.issue_file(&message.issue_id);
        let mut messages = Self::load(&path)?;
        messages.push(message);
        Self::store(&path, &messages)
    }

    async fn receive(&self, issue_id: &str, phase: &str, mark_as_read: bool) -> Result<Vec<PhaseMessage>> {
        let _guard = self.guard.lock().map_err(|_| anyhow!("messenger lock poisoned"))?;
        let path = self.issue_file(issue_id);
        let mut messages = Self::load(&path)?;
        let unread = take_unread(&mut messages, issue_id, phase, mark_as_read);
        if mark_as_read && !unread.is_empty() {
            Self::store(&path, &messages)?;
        }
        Ok(unread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_receive_marks_read() {
        let messenger = MemoryMessenger::new();
        messenger
            .send(PhaseMessage::new("bd-1", "plan", "implement", MessageType::Result, "plan done"))
            .await
            .unwrap();
        messenger
            .send(PhaseMessage::new("bd-1", "plan", "test", MessageType::Context, "other phase"))
            .await
            .unwrap();

        let peek = messenger.receive("bd-1", "implement", false).await.unwrap();
        assert_eq!(peek.len(), 1);
        let taken = messenger.receive("bd-1", "implement", true).await.unwrap();
        assert_eq!(taken[0].content, "plan done");
        assert!(messenger.receive("bd-1", "implement", true).await.unwrap().is_empty());
        assert_eq!(messenger.receive("bd-1", "test", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_messenger_roundtrip() {
        let dir = tempdir().unwrap();
        let messenger = FileMessenger::new(dir.path().join("messages"));
        messenger
            .send(
                PhaseMessage::new("bd/7", "implement", "review", MessageType::Data, "diff summary")
                    .with_metadata(serde_json::json!({"files": 3})),
            )
            .await
            .unwrap();

        assert!(dir.path().join("messages/bd_7.json").exists());
        let got = messenger.receive("bd/7", "review", true).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata["files"], 3);
        assert!(messenger.receive("bd/7", "review", true).await.unwrap().is_empty());
    }
}
