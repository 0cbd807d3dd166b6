//! The poll loop: `conductor run` and `conductor once`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use conductor::audit::JsonlRunLog;
use conductor::conductor_config::TrackerKind;
use conductor::config::Config;
use conductor::executor::ClaudePlatform;
use conductor::messenger::FileMessenger;
use conductor::tracker::{BeadsTracker, IssueTracker, MemoryTracker};
use conductor::transition::TransitionKind;
use conductor::worker::{CycleReport, IssueReport, Ports, WorkerLoop};

use super::load_config;
use crate::Cli;

/// Wire the configured tracker, platform, audit log and messenger into a worker.
fn build_worker(config: &Config, tracker: Option<TrackerKind>) -> Result<WorkerLoop> {
    let toml = &config.toml;
    let warnings = toml.validate().context("Configuration is invalid")?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    config.ensure_directories()?;
    let store = toml.build_store()?;

    let tracker: Arc<dyn IssueTracker> = match tracker.unwrap_or(toml.tracker.kind) {
        TrackerKind::Beads => {
            Arc::new(BeadsTracker::new(toml.tracker.bin.clone()).with_workdir(config.project_dir.clone()))
        }
        TrackerKind::Memory => {
            warn!("memory tracker has no issues; nothing will be processed");
            Arc::new(MemoryTracker::new())
        }
    };

    let platform = ClaudePlatform::new(config.claude_cmd(), config.agent_workdir())
        .with_skip_permissions(config.skip_permissions());

    let ports = Ports {
        tracker,
        registry: Arc::new(toml.registry()),
        platform: Arc::new(platform),
        run_log: Arc::new(JsonlRunLog::open(&config.audit_dir)?),
        messenger: Arc::new(FileMessenger::new(config.messages_dir.clone())),
    };

    Ok(WorkerLoop::new(store, toml.resolver(), ports)
        .with_config(toml.worker.clone())
        .with_hitl(toml.hitl_policy()?)
        .with_assistant(toml.worker_assistant.clone())
        .with_session(toml.session.clone())
        .with_templates(toml.templates.clone()))
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    interval: Option<u64>,
    tracker: Option<TrackerKind>,
) -> Result<()> {
    let mut config = load_config(cli, project_dir)?;
    if let Some(secs) = interval {
        config.toml.worker.poll_interval_secs = secs;
    }
    let worker = build_worker(&config, tracker)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                style("Shutting down after the current issue...").yellow()
            );
            let _ = tx.send(true);
        }
    });

    info!(
        project = %config.project_name(),
        interval_secs = worker.config().poll_interval_secs,
        "conductor started"
    );
    worker.run(rx).await?;
    info!("conductor stopped");
    Ok(())
}

pub async fn cmd_once(cli: &Cli, project_dir: &Path, tracker: Option<TrackerKind>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let worker = build_worker(&config, tracker)?;
    let report = worker.run_cycle(None).await?;
    print_report(&report);
    if !report.errors.is_empty() {
        anyhow::bail!("{} issue(s) failed to process", report.errors.len());
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!();
    for (issue, outcome) in &report.processed {
        match outcome {
            IssueReport::Transitioned {
                phase,
                kind,
                next_phase,
                reason,
                ..
            } => {
                let label = match kind {
                    TransitionKind::Advance | TransitionKind::JumpBack => style(kind.to_string()).green(),
                    TransitionKind::Close => style(kind.to_string()).green().bold(),
                    TransitionKind::Retry => style(kind.to_string()).yellow(),
                    TransitionKind::Block => style(kind.to_string()).red().bold(),
                    TransitionKind::DynamicDecision => style(kind.to_string()).cyan(),
                };
                let target = next_phase
                    .as_deref()
                    .map(|p| format!(" -> {}", p))
                    .unwrap_or_default();
                println!("  {} [{}] {}{}: {}", issue, phase, label, target, style(reason).dim());
            }
            IssueReport::NoAgent { phase } => {
                println!(
                    "  {} [{}] {}",
                    issue,
                    phase,
                    style("no suitable agent").yellow()
                );
            }
        }
    }
    for (issue, error) in &report.errors {
        println!("  {} {}", issue, style(error).red());
    }
    println!();
    println!("{}", report.summary());
}
