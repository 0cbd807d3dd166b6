//! Policy inspection: `conductor policies [list|show|resolve]`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use conductor::policy::{Phase, Policy, PolicyStore};
use conductor::tracker::Issue;

use super::load_config;
use crate::{Cli, PoliciesCommands};

pub fn cmd_policies(cli: &Cli, project_dir: &Path, command: Option<PoliciesCommands>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = config
        .toml
        .build_store()
        .context("Configured policies are invalid")?;

    match command {
        None | Some(PoliciesCommands::List) => list(&store),
        Some(PoliciesCommands::Show { name }) => {
            let Some(policy) = store.get(&name) else {
                anyhow::bail!(
                    "Unknown policy: '{}'. Valid values: {}",
                    name,
                    store.names().join(", ")
                );
            };
            show(policy, store.default_policy_name() == policy.name);
        }
        Some(PoliciesCommands::Resolve { issue_type, labels }) => {
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            let issue = Issue::new("preview", "preview")
                .with_type(&issue_type)
                .with_labels(&labels);
            let resolver = config.toml.resolver();
            let resolution = resolver.resolve(&store, &issue)?;

            println!();
            println!(
                "Issue type '{}' resolves to policy {} ({})",
                issue_type,
                style(&resolution.policy).bold().cyan(),
                resolution.source
            );
            if let Some(warning) = &resolution.warning {
                println!("  {} {}", style("warning:").yellow(), warning);
            }
            if let Some(policy) = store.get(&resolution.policy) {
                let start = resolver
                    .labels()
                    .current_phase(&issue.labels)
                    .filter(|p| policy.phase(p).is_some())
                    .or_else(|| policy.first_phase().map(|p| p.name.as_str()));
                if let Some(start) = start {
                    println!("  starts at phase '{}'", start);
                }
            }
            println!();
        }
    }
    Ok(())
}

fn list(store: &PolicyStore) {
    println!();
    println!("{}", style("Policies").bold().cyan());
    println!();
    println!(
        "  {:<16} {:>8}  {:<24} {}",
        style("NAME").bold(),
        style("PRIORITY").bold(),
        style("ISSUE TYPES").bold(),
        style("PHASES").bold()
    );
    for policy in store.policies() {
        let marker = if policy.name == store.default_policy_name() { "*" } else { " " };
        let types = if policy.issue_types.is_empty() {
            "-".to_string()
        } else {
            policy.issue_types.join(", ")
        };
        let phases: Vec<&str> = policy.phases.iter().map(|p| p.name.as_str()).collect();
        println!(
            "{} {:<16} {:>8}  {:<24} {}",
            marker,
            policy.name,
            policy.priority,
            types,
            phases.join(" -> ")
        );
    }
    println!();
    println!("{}", style("* default policy").dim());
    println!();
}

fn show(policy: &Policy, is_default: bool) {
    println!();
    print!("{}", style(&policy.name).bold().cyan());
    if is_default {
        print!(" {}", style("(default)").dim());
    }
    println!();
    if let Some(description) = &policy.description {
        println!("  {}", description);
    }
    println!();
    if !policy.issue_types.is_empty() {
        println!("  issue types: {}", policy.issue_types.join(", "));
    }
    println!("  priority: {}", policy.priority);
    println!(
        "  retry: {} attempts, {} backoff, {}ms initial, {}ms max",
        policy.retry.max_attempts,
        policy.retry.backoff_strategy,
        policy.retry.initial_delay_ms,
        policy.retry.max_delay_ms
    );
    println!("  timeout base: {}ms", policy.timeout_base_ms);
    if policy.require_hitl {
        println!("  blocked issues always carry a HITL label");
    }
    if policy.disable_worker_assistant {
        println!("  worker assistant disabled");
    }
    println!();

    for (i, phase) in policy.phases.iter().enumerate() {
        println!("  {}. {}", i + 1, style(&phase.name).bold());
        for line in phase_details(policy, phase) {
            println!("       {}", line);
        }
    }
    println!();
}

fn phase_details(policy: &Policy, phase: &Phase) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(agent) = &phase.agent {
        lines.push(format!("agent: {}", agent));
    } else if !phase.capabilities.is_empty() {
        lines.push(format!("capabilities: {}", phase.capabilities.join(", ")));
    }
    if let Some(model) = &phase.model {
        lines.push(format!("model: {}", model));
    }
    if (phase.timeout_multiplier - 1.0).abs() > f64::EPSILON {
        lines.push(format!("timeout x{}", phase.timeout_multiplier));
    }
    if phase.require_approval {
        lines.push(style("requires human approval").yellow().to_string());
    }
    if let Some(target) = &phase.reuse_session {
        lines.push(format!("reuses session: {}", target));
    }
    if let Some(template) = &phase.prompt_template {
        lines.push(format!("prompt template: {}", template));
    }
    if let Some(decision) = &phase.decision {
        lines.push(format!(
            "decision agent ({}): routes to {} below {} confidence needs approval",
            decision.capability,
            decision.destinations(policy).join(", "),
            decision.thresholds.require_approval
        ));
    }
    lines
}
