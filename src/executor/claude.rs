//! Agent platform that runs the Claude CLI as a subprocess.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{AgentPlatform, DispatchRequest, Execution};
use crate::errors::DispatchError;

#[derive(Debug, Clone)]
pub struct ClaudePlatform {
    claude_cmd: String,
    workdir: PathBuf,
    skip_permissions: bool,
}

impl ClaudePlatform {
    pub fn new(claude_cmd: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            workdir: workdir.into(),
            skip_permissions: true,
        }
    }

    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    /// CLI flags for one dispatch. The prompt itself goes over stdin.
    pub fn flags(&self, request: &DispatchRequest) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &request.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(session) = &request.session_id {
            flags.push("--resume".to_string());
            flags.push(session.clone());
        }
        flags
    }
}

#[async_trait]
impl AgentPlatform for ClaudePlatform {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Execution, DispatchError> {
        let start = Instant::now();
        let flags = self.flags(request);
        tracing::info!(
            agent = %request.agent_id,
            model = request.model.as_deref().unwrap_or("default"),
            resume = request.session_id.is_some(),
            "spawning {} {}",
            self.claude_cmd,
            flags.join(" ")
        );

        let mut child = Command::new(&self.claude_cmd)
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DispatchError::SpawnFailed {
                command: self.claude_cmd.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.instructions.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture agent stdout"))?;
        // Drain stderr concurrently so a chatty agent cannot fill the pipe and stall.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                buf
            })
        });

        let mut reader = BufReader::new(stdout).lines();
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await? {
            lines.push(line);
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task
            && let Ok(stderr) = task.await
            && !status.success()
            && !stderr.trim().is_empty()
        {
            tracing::warn!(agent = %request.agent_id, stderr = %stderr.trim(), "agent process reported errors");
        }

        Ok(Execution {
            lines,
            exit_code: status.code(),
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_with_model_and_session() {
        let platform = ClaudePlatform::new("claude", "/tmp");
        let request = DispatchRequest::new("coder", "do it")
            .with_model(Some("claude-opus".to_string()))
            .with_session(Some("sess-9".to_string()));
        let flags = platform.flags(&request);
        assert_eq!(&flags[..4], ["--print", "--output-format", "stream-json", "--verbose"]);
        assert!(flags.contains(&"--dangerously-skip-permissions".to_string()));
        let model_idx = flags.iter().position(|f| f == "--model").unwrap();
        assert_eq!(flags[model_idx + 1], "claude-opus");
        let resume_idx = flags.iter().position(|f| f == "--resume").unwrap();
        assert_eq!(flags[resume_idx + 1], "sess-9");
    }

    #[test]
    fn test_flags_minimal() {
        let platform = ClaudePlatform::new("claude", "/tmp").with_skip_permissions(false);
        let flags = platform.flags(&DispatchRequest::new("coder", "x"));
        assert_eq!(flags.len(), 4);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_dispatch_error() {
        let platform = ClaudePlatform::new("/nonexistent/claude-binary", std::env::temp_dir());
        let err = platform
            .dispatch(&DispatchRequest::new("coder", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "spawn_failed");
    }
}
