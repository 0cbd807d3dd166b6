//! Audit trail inspection: `conductor audit runs|decisions`.

use anyhow::Result;
use console::style;
use std::path::Path;

use conductor::audit::{JsonlRunLog, RunStatus};

use super::load_config;
use crate::{AuditCommands, Cli};

pub fn cmd_audit(cli: &Cli, project_dir: &Path, command: &AuditCommands) -> Result<()> {
    let config = load_config(cli, project_dir)?;

    match command {
        AuditCommands::Runs { issue, limit } => {
            let runs: Vec<_> = JsonlRunLog::read_runs(&config.audit_dir)?
                .into_iter()
                .filter(|r| issue.as_ref().is_none_or(|id| &r.issue_id == id))
                .collect();
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            let skip = runs.len().saturating_sub(*limit);

            println!();
            println!(
                "{:<20} {:<12} {:<12} {:<12} {:<10} {:>8} {:>10}",
                style("STARTED").bold(),
                style("ISSUE").bold(),
                style("PHASE").bold(),
                style("AGENT").bold(),
                style("STATUS").bold(),
                style("TOKENS").bold(),
                style("DURATION").bold()
            );
            for run in runs.iter().skip(skip) {
                let status = match run.status {
                    RunStatus::Completed => style(run.status.to_string()).green(),
                    RunStatus::Failed => style(run.status.to_string()).red(),
                    RunStatus::Blocked => style(run.status.to_string()).red().bold(),
                    RunStatus::Pending | RunStatus::Running => style(run.status.to_string()).yellow(),
                };
                println!(
                    "{:<20} {:<12} {:<12} {:<12} {:<10} {:>8} {:>9.1}s",
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.issue_id,
                    run.phase,
                    run.agent_id,
                    status,
                    run.tokens_used(),
                    run.duration_ms() as f64 / 1000.0
                );
                if let Some(error) = run.outcome.as_ref().and_then(|o| o.error.as_ref()) {
                    println!("{:<20} {}", "", style(&error.message).dim());
                }
            }
            println!();
            println!("{} of {} runs shown", runs.len() - skip, runs.len());
        }
        AuditCommands::Decisions { issue, limit } => {
            let decisions: Vec<_> = JsonlRunLog::read_decisions(&config.audit_dir)?
                .into_iter()
                .filter(|d| issue.as_ref().is_none_or(|id| &d.issue_id == id))
                .collect();
            if decisions.is_empty() {
                println!("No decisions recorded.");
                return Ok(());
            }
            let skip = decisions.len().saturating_sub(*limit);

            println!();
            for record in decisions.iter().skip(skip) {
                println!(
                    "{} {:<12} {:<22} {}",
                    style(record.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                    record.issue_id,
                    style(record.decision_type.to_string()).cyan(),
                    style(&record.decision).bold()
                );
                if !record.reasoning.is_empty() {
                    println!("    {}", record.reasoning);
                }
            }
            println!();
            println!("{} of {} decisions shown", decisions.len() - skip, decisions.len());
        }
    }
    Ok(())
}
