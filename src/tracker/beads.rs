//! Issue tracker backed by the `bd` (beads) CLI.
//!
//! beads is binary-only, so every operation shells out and parses `--json`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::{Issue, IssueStatus, IssueTracker, IssueUpdate};
use crate::errors::TrackerError;

pub struct BeadsTracker {
    bin: String,
    workdir: Option<std::path::PathBuf>,
}

impl BeadsTracker {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let shown = format!("{} {}", self.bin, args.join(" "));
        tracing::debug!(command = %shown, "running tracker command");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run `{}`. Is beads installed?", shown))?;

        if !output.status.success() {
            return Err(TrackerError::CommandFailed {
                command: shown,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }
}

/// Parse `bd ... --json` output that may be a single issue or a list.
pub fn parse_issues(stdout: &[u8]) -> Result<Vec<Issue>, TrackerError> {
    let value: Value = serde_json::from_slice(stdout)?;
    let issues = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Issue>, _>>()?,
        Value::Null => Vec::new(),
        other => vec![serde_json::from_value(other)?],
    };
    Ok(issues)
}

/// The `bd` invocations that apply `update` to issue `id`, in order.
pub fn update_commands(id: &str, update: &IssueUpdate) -> Vec<Vec<String>> {
    let mut commands = Vec::new();

    for label in &update.remove_labels {
        commands.push(vec![
            "label".to_string(),
            "remove".to_string(),
            id.to_string(),
            label.clone(),
        ]);
    }
    for label in &update.add_labels {
        commands.push(vec![
            "label".to_string(),
            "add".to_string(),
            id.to_string(),
            label.clone(),
        ]);
    }

    if update.status == Some(IssueStatus::Closed) {
        let mut close = vec!["close".to_string(), id.to_string()];
        if let Some(note) = &update.note {
            close.push(format!("--reason={note}"));
        }
        commands.push(close);
        if let Some(priority) = update.priority {
            commands.push(vec![
                "update".to_string(),
                id.to_string(),
                format!("--priority={priority}"),
            ]);
        }
        return commands;
    }

    let mut args = vec!["update".to_string(), id.to_string()];
    if let Some(status) = update.status {
        args.push(format!("--status={status}"));
    }
    if let Some(priority) = update.priority {
        args.push(format!("--priority={priority}"));
    }
    if let Some(note) = &update.note {
        args.push(format!("--notes={note}"));
    }
    if args.len() > 2 {
        commands.push(args);
    }
    commands
}

#[async_trait]
impl IssueTracker for BeadsTracker {
    async fn ready_work(&self, limit: usize) -> Result<Vec<Issue>> {
        let stdout = self
            .run(&[
                "ready".to_string(),
                "--json".to_string(),
                format!("--limit={limit}"),
            ])
            .await?;
        let mut issues = parse_issues(&stdout).context("Failed to parse `bd ready` output")?;
        issues.truncate(limit);
        Ok(issues)
    }

    async fn get(&self, id: &str) -> Result<Issue> {
        let stdout = self
            .run(&["show".to_string(), id.to_string(), "--json".to_string()])
            .await?;
        parse_issues(&stdout)
            .context("Failed to parse `bd show` output")?
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::IssueNotFound { id: id.to_string() }.into())
    }

    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()> {
        for args in update_commands(id, &update) {
            self.run(&args).await?;
        }
        Ok(())
    }
}
