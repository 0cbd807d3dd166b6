//! Configuration view and validation commands: `conductor config`, `conductor init`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use conductor::conductor_config::{CONFIG_FILE, ConductorToml, DEFAULT_CONFIG};

use super::load_config;
use crate::{Cli, ConfigCommands};

/// Write the starter config. Refuses to overwrite unless `force`.
pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let conductor_dir = project_dir.join(".conductor");
    let config_path = conductor_dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        println!(
            "{} conductor.toml already exists at {}",
            style("!").yellow(),
            config_path.display()
        );
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    for sub in ["audit", "messages", "logs"] {
        std::fs::create_dir_all(conductor_dir.join(sub))
            .with_context(|| format!("Failed to create .conductor/{}", sub))?;
    }
    std::fs::write(&config_path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("{} Created {}", style("✓").green().bold(), config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit agents and policies in conductor.toml");
    println!("  2. Run 'conductor config validate'");
    println!("  3. Run 'conductor once' to drive a single cycle");
    Ok(())
}

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(cli, project_dir),
        Some(ConfigCommands::Validate) => validate(cli, project_dir),
        Some(ConfigCommands::Init) => cmd_init(project_dir, false),
    }
}

fn show(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let toml = &config.toml;

    println!();
    println!("{}", style("Conductor Configuration").bold().cyan());
    println!();
    if config.config_exists() {
        println!("Config file: {}", config.config_file.display());
    } else {
        println!(
            "No conductor.toml found at {}; showing defaults.",
            config.config_file.display()
        );
        println!("Run 'conductor init' to create one.");
    }
    println!();

    println!("{}", style("[project]").bold());
    println!("  name = \"{}\"", config.project_name());
    println!("  workdir = \"{}\"", config.agent_workdir().display());
    println!();

    println!("{}", style("[worker]").bold());
    println!("  poll_interval_secs = {}", toml.worker.poll_interval_secs);
    println!("  max_concurrent_runs = {}", toml.worker.max_concurrent_runs);
    println!("  max_issues_per_cycle = {}", toml.worker.max_issues_per_cycle);
    println!("  ready_limit = {}", toml.worker.ready_limit);
    if let Some(model) = &toml.worker.default_model {
        println!("  default_model = \"{}\"", model);
    }
    println!();

    println!("{}", style("[labels]").bold());
    println!("  prefix = \"{}\"", toml.labels.prefix);
    println!("  override_strategy = \"{}\"", toml.labels.override_strategy);
    println!("  hitl_reasons = {:?}", toml.labels.hitl_reasons);
    if let Some(pattern) = &toml.labels.hitl_pattern {
        println!("  hitl_pattern = \"{}\"", pattern);
    }
    println!();

    println!("{}", style("[worker_assistant]").bold());
    println!("  enabled = {}", toml.worker_assistant.enabled);
    println!("  capability = \"{}\"", toml.worker_assistant.capability);
    println!("  fallback_action = \"{}\"", toml.worker_assistant.fallback_action);
    println!();

    println!("{}", style("[session]").bold());
    println!("  enabled = {}", toml.session.enabled);
    println!("  threshold = {}", toml.session.threshold);
    println!("  max_context_tokens = {}", toml.session.max_context_tokens);
    println!();

    println!("{}", style("[tracker]").bold());
    println!("  kind = \"{}\"", toml.tracker.kind);
    println!("  bin = \"{}\"", toml.tracker.bin);
    println!();

    println!(
        "Agents: {}",
        toml.agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "Policies: {}",
        toml.policies.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    if !toml.templates.is_empty() {
        let mut keys: Vec<_> = toml.templates.keys().map(String::as_str).collect();
        keys.sort_unstable();
        println!("Templates: {}", keys.join(", "));
    }
    println!();

    println!("Effective values (with env overrides):");
    println!("  claude_cmd = \"{}\"", config.claude_cmd());
    println!("  skip_permissions = {}", config.skip_permissions());
    println!();
    Ok(())
}

fn validate(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;

    println!();
    println!("Validating {}...", config.config_file.display());
    println!();

    if !config.config_exists() {
        anyhow::bail!("No conductor.toml found. Run 'conductor init' first.");
    }

    // Re-read so a --config path outside .conductor/ is validated as written.
    let toml = ConductorToml::load(&config.config_file)?;
    match toml.validate() {
        Ok(warnings) if warnings.is_empty() => {
            println!("{} Configuration is valid.", style("✓").green().bold());
        }
        Ok(warnings) => {
            println!("{} Configuration is valid, with warnings:", style("✓").green().bold());
            for warning in warnings {
                println!("  {} {}", style("-").yellow(), warning);
            }
        }
        Err(e) => {
            println!("{} {}", style("Invalid configuration:").red().bold(), e);
            return Err(e.into());
        }
    }
    println!();
    Ok(())
}
