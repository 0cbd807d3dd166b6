use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::conductor_config::{CONFIG_FILE, ConductorToml};

/// Runtime configuration: project paths plus the parsed `conductor.toml`,
/// with environment and CLI overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub config_file: PathBuf,
    pub audit_dir: PathBuf,
    pub messages_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: ConductorToml,
}

impl Config {
    /// Load from `<project>/.conductor/`. A missing config file yields defaults.
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let conductor_dir = project_dir.join(".conductor");
        let toml = ConductorToml::load_or_default(&conductor_dir)?;
        Ok(Self::from_parts(project_dir, conductor_dir, toml, verbose))
    }

    /// Load from an explicit config file; state still lives next to it.
    pub fn from_file(project_dir: &Path, config_file: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let toml = ConductorToml::load(config_file)?;
        let conductor_dir = project_dir.join(".conductor");
        let mut config = Self::from_parts(project_dir, conductor_dir, toml, verbose);
        config.config_file = config_file.to_path_buf();
        Ok(config)
    }

    fn from_parts(project_dir: PathBuf, conductor_dir: PathBuf, toml: ConductorToml, verbose: bool) -> Self {
        Self {
            config_file: conductor_dir.join(CONFIG_FILE),
            audit_dir: conductor_dir.join("audit"),
            messages_dir: conductor_dir.join("messages"),
            log_dir: conductor_dir.join("logs"),
            project_dir,
            conductor_dir,
            verbose,
            toml,
        }
    }

    pub fn config_exists(&self) -> bool {
        self.config_file.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        std::fs::create_dir_all(&self.messages_dir).context("Failed to create messages directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Directory agent processes run in.
    pub fn agent_workdir(&self) -> PathBuf {
        match &self.toml.project.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.project_dir.clone(),
        }
    }

    pub fn claude_cmd(&self) -> String {
        self.toml.claude_cmd()
    }

    pub fn skip_permissions(&self) -> bool {
        self.toml.skip_permissions()
    }

    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        })
    }
}
