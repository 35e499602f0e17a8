//! Configuration management for upkeep
//!
//! Handles loading, saving, and default configuration values.
//! Config file location: ~/.config/upkeep/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub theme: ThemeName,
    pub auto_restart: bool,
    pub confirm_restart: bool,
    pub verbose: bool,
    pub execution: ExecutionConfig,
    pub setup: SetupConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: ThemeName::Gruvbox,
            auto_restart: false,
            confirm_restart: true,
            verbose: false,
            execution: ExecutionConfig::default(),
            setup: SetupConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("upkeep");
        Ok(config_dir.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::path()?;

        if !path.exists() {
            let config = Config::default();
            config.save()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {:?}", path))
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        Ok(())
    }

    /// Directory holding the audit log, last-action marker and diagnostics log
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.log.directory {
            return Ok(dir.clone());
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|d| d.join("upkeep"))
            .context("Could not determine state directory")
    }
}

/// Available theme names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeName {
    #[default]
    Gruvbox,
    Nord,
    Transparent,
}

impl ThemeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeName::Gruvbox => "Gruvbox",
            ThemeName::Nord => "Nord",
            ThemeName::Transparent => "Transparent",
        }
    }

    pub fn next(&self) -> Self {
        match self {
            ThemeName::Gruvbox => ThemeName::Nord,
            ThemeName::Nord => ThemeName::Transparent,
            ThemeName::Transparent => ThemeName::Gruvbox,
        }
    }
}

/// How external commands are run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Front-end (program + args) prepended to privileged steps
    pub elevation: Vec<String>,
    /// Capacity of the child -> observer line queue
    pub output_buffer: usize,
    /// Seconds to wait after SIGTERM before killing a cancelled child
    pub terminate_grace_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            elevation: vec!["sudo".to_string()],
            output_buffer: 256,
            terminate_grace_secs: 10,
        }
    }
}

impl ExecutionConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Packages installed by the Setup action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub packages: Vec<String>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            packages: crate::system::strategy::SETUP_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Diagnostics and audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}
