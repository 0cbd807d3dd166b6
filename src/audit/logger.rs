//! Durable run/decision logs.
//!
//! [`JsonlRunLog`] appends one JSON object per line to `runs.jsonl` and
//! `decisions.jsonl` under the audit directory. Run updates are appended as
//! full snapshots; readers fold snapshots by run id. The log holds an
//! exclusive lock on `audit.lock` for its lifetime, so one process writes.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DecisionRecord, Run};

#[async_trait]
pub trait RunLog: Send + Sync {
    /// Record a new, non-terminal run.
    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Record the single terminal update of a run.
    async fn update_run(&self, run: &Run) -> Result<()>;

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// Latest state of every run of an issue, oldest first.
    async fn runs_for_issue(&self, issue_id: &str) -> Result<Vec<Run>>;

    async fn decisions_for_issue(&self, issue_id: &str) -> Result<Vec<DecisionRecord>>;
}

/// Run index shared by both log implementations.
#[derive(Debug, Default)]
struct RunIndex {
    runs: Vec<Run>,
    by_id: HashMap<String, usize>,
}

impl RunIndex {
    fn check_new(&self, run: &Run) -> Result<()> {
        if self.by_id.contains_key(&run.id) {
            bail!("run {} already exists", run.id);
        }
        if run.status.is_terminal() {
            bail!("run {} must be created in a non-terminal status", run.id);
        }
        Ok(())
    }

    fn check_update(&self, run: &Run) -> Result<usize> {
        let idx = *self
            .by_id
            .get(&run.id)
            .ok_or_else(|| anyhow!("run {} was never created", run.id))?;
        let existing = &self.runs[idx];
        if existing.status.is_terminal() {
            bail!("run {} is already {} and cannot change", run.id, existing.status);
        }
        Ok(idx)
    }

    fn insert(&mut self, run: &Run) -> Result<()> {
        self.check_new(run)?;
        self.by_id.insert(run.id.clone(), self.runs.len());
        self.runs.push(run.clone());
        Ok(())
    }

    fn update(&mut self, run: &Run) -> Result<()> {
        let idx = self.check_update(run)?;
        self.runs[idx] = run.clone();
        Ok(())
    }

    /// Fold a snapshot read back from disk; later snapshots win.
    fn fold(&mut self, run: Run) {
        match self.by_id.get(&run.id) {
            Some(&idx) => self.runs[idx] = run,
            None => {
                self.by_id.insert(run.id.clone(), self.runs.len());
                self.runs.push(run);
            }
        }
    }

    fn for_issue(&self, issue_id: &str) -> Vec<Run> {
        self.runs
            .iter()
            .filter(|r| r.issue_id == issue_id)
            .cloned()
            .collect()
    }
}

/// In-memory log for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    runs: Mutex<RunIndex>,
    decisions: Mutex<Vec<DecisionRecord>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_runs(&self) -> Vec<Run> {
        self.runs.lock().map(|r| r.runs.clone()).unwrap_or_default()
    }

    pub fn all_decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn create_run(&self, run: &Run) -> Result<()> {
        self.runs
            .lock()
            .map_err(|_| anyhow!("run log lock poisoned"))?
            .insert(run)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        self.runs
            .lock()
            .map_err(|_| anyhow!("run log lock poisoned"))?
            .update(run)
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.decisions
            .lock()
            .map_err(|_| anyhow!("decision log lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    async fn runs_for_issue(&self, issue_id: &str) -> Result<Vec<Run>> {
        Ok(self
            .runs
            .lock()
            .map_err(|_| anyhow!("run log lock poisoned"))?
            .for_issue(issue_id))
    }

    async fn decisions_for_issue(&self, issue_id: &str) -> Result<Vec<DecisionRecord>> {
        Ok(self
            .decisions
            .lock()
            .map_err(|_| anyhow!("decision log lock poisoned"))?
            .iter()
            .filter(|d| d.issue_id == issue_id)
            .cloned()
            .collect())
    }
}

/// Append-only JSONL log on disk.
pub struct JsonlRunLog {
    runs_file: PathBuf,
    decisions_file: PathBuf,
    index: Mutex<RunIndex>,
    // Held for the lifetime of the log; dropping it releases the lock.
    _lock: File,
}

impl JsonlRunLog {
    /// Open (or create) the log under `audit_dir`, taking the writer lock.
    pub fn open(audit_dir: &Path) -> Result<Self> {
        fs::create_dir_all(audit_dir)
            .with_context(|| format!("Failed to create audit directory {}", audit_dir.display()))?;

        let lock_path = audit_dir.join("audit.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "Another conductor process holds the audit log at {}",
                audit_dir.display()
            )
        })?;

        let runs_file = audit_dir.join("runs.jsonl");
        let decisions_file = audit_dir.join("decisions.jsonl");

        let mut index = RunIndex::default();
        for run in read_jsonl::<Run>(&runs_file)? {
            index.fold(run);
        }

        Ok(Self {
            runs_file,
            decisions_file,
            index: Mutex::new(index),
            _lock: lock,
        })
    }

    /// Read runs without taking the writer lock, for inspection commands.
    pub fn read_runs(audit_dir: &Path) -> Result<Vec<Run>> {
        let mut index = RunIndex::default();
        for run in read_jsonl::<Run>(&audit_dir.join("runs.jsonl"))? {
            index.fold(run);
        }
        Ok(index.runs)
    }

    pub fn read_decisions(audit_dir: &Path) -> Result<Vec<DecisionRecord>> {
        read_jsonl(&audit_dir.join("decisions.jsonl"))
    }
}

fn append_line<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("Failed to serialize audit entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => out.push(value),
            // A torn final write must not make the whole log unreadable.
            Err(e) => tracing::warn!(
                file = %path.display(),
                line = lineno + 1,
                error = %e,
                "skipping corrupt audit line"
            ),
        }
    }
    Ok(out)
}

#[async_trait]
impl RunLog for JsonlRunLog {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut index = self.index.lock().map_err(|_| anyhow!("run log lock poisoned"))?;
        index.check_new(run)?;
        append_line(&self.runs_file, run)?;
        index.insert(run)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut index = self.index.lock().map_err(|_| anyhow!("run log lock poisoned"))?;
        index.check_update(run)?;
        append_line(&self.runs_file, run)?;
        index.update(run)
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        append_line(&self.decisions_file, record)
    }

    async fn runs_for_issue(&self, issue_id: &str) -> Result<Vec<Run>> {
        Ok(self
            .index
            .lock()
            .map_err(|_| anyhow!("run log lock poisoned"))?
            .for_issue(issue_id))
    }

    async fn decisions_for_issue(&self, issue_id: &str) -> Result<Vec<DecisionRecord>> {
        Ok(read_jsonl::<DecisionRecord>(&self.decisions_file)?
            .into_iter()
            .filter(|d| d.issue_id == issue_id)
            .collect())
    }
}
