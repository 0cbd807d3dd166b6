use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use conductor::conductor_config::TrackerKind;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Drive AI coding agents through policy-defined phases of an issue backlog")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to use instead of .conductor/conductor.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .conductor/ with a starter conductor.toml
    Init {
        /// Overwrite an existing conductor.toml
        #[arg(long)]
        force: bool,
    },
    /// Poll the tracker and drive ready issues until interrupted
    Run {
        /// Seconds between poll cycles (overrides worker.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Tracker backend (overrides tracker.kind)
        #[arg(long)]
        tracker: Option<TrackerKind>,
    },
    /// Run a single poll cycle and exit
    Once {
        #[arg(long)]
        tracker: Option<TrackerKind>,
    },
    /// Inspect configured policies
    Policies {
        #[command(subcommand)]
        command: Option<PoliciesCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect recorded runs and decisions
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum PoliciesCommands {
    /// List policies in resolution order
    List,
    /// Show one policy's phases and rules
    Show { name: String },
    /// Show which policy an issue would be driven by
    Resolve {
        /// Issue type
        #[arg(short = 't', long = "type", default_value = "task")]
        issue_type: String,
        /// Issue label (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[derive(Subcommand, Clone)]
pub enum AuditCommands {
    /// List runs, newest last
    Runs {
        #[arg(long)]
        issue: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// List decision records, newest last
    Decisions {
        #[arg(long)]
        issue: Option<String>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    std::env::var("CONDUCTOR_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// stderr logging, plus a daily-rolling JSON file under `log_dir` when given.
fn init_logging(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(verbose))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(verbose))
            .boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "conductor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(env_filter(verbose));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only the long-running commands log to a file.
    let log_dir = match &cli.command {
        Commands::Run { .. } | Commands::Once { .. } => Some(project_dir.join(".conductor").join("logs")),
        _ => None,
    };
    let _guard = init_logging(cli.verbose, cli.log_json, log_dir.as_deref());

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Run { interval, tracker } => {
            cmd::cmd_run(&cli, &project_dir, *interval, *tracker).await?
        }
        Commands::Once { tracker } => cmd::cmd_once(&cli, &project_dir, *tracker).await?,
        Commands::Policies { command } => cmd::cmd_policies(&cli, &project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
        Commands::Audit { command } => cmd::cmd_audit(&cli, &project_dir, command)?,
    }

    Ok(())
}
