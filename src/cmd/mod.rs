//! CLI command implementations.
//!
//! | Module     | Commands handled                  |
//! |------------|-----------------------------------|
//! | `run`      | `Run`, `Once`                     |
//! | `policies` | `Policies`                        |
//! | `config`   | `Config`, `Init`                  |
//! | `audit`    | `Audit`                           |

pub mod audit;
pub mod config;
pub mod policies;
pub mod run;

pub use audit::cmd_audit;
pub use config::{cmd_config, cmd_init};
pub use policies::cmd_policies;
pub use run::{cmd_once, cmd_run};

use anyhow::Result;
use std::path::Path;

use conductor::config::Config;

use crate::Cli;

/// Project config, honoring `--config` when given.
pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    match &cli.config {
        Some(file) => Config::from_file(project_dir, file, cli.verbose),
        None => Config::new(project_dir, cli.verbose),
    }
}
