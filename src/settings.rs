//! Runtime settings
//!
//! Defaults, then an optional YAML file, then `FLOTILLA_*` environment
//! variables.

use crate::cluster::StartMode;
use crate::error::{FlotillaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "FLOTILLA_CONFIG";
/// Settings file looked up in the home directory
pub const DEFAULT_CONFIG_FILE: &str = ".flotilla.yaml";

/// Flotilla settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Container engine CLI
    pub docker_binary: PathBuf,
    /// Host that published ports are reached on
    pub host: String,
    /// Readiness timeout for nodes without their own
    pub startup_timeout_secs: u64,
    /// Allow nodes that opt in to attach to running identical nodes
    pub reuse_enabled: bool,
    pub start_mode: StartMode,
    /// Prefix of generated network names
    pub network_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_binary: PathBuf::from("docker"),
            host: "localhost".to_string(),
            startup_timeout_secs: 60,
            reuse_enabled: false,
            start_mode: StartMode::Sequential,
            network_prefix: "flotilla".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the default file and the process environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE)));

        let mut settings = match path {
            Some(ref path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };

        settings.apply_env_from(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Read settings from a YAML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Apply `FLOTILLA_*` overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).and_then(|v| {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        };

        if let Some(binary) = var("FLOTILLA_DOCKER_BIN") {
            self.docker_binary = PathBuf::from(binary);
        }
        if let Some(host) = var("FLOTILLA_HOST_OVERRIDE") {
            self.host = host;
        }
        if let Some(secs) = var("FLOTILLA_STARTUP_TIMEOUT_SECS") {
            self.startup_timeout_secs = secs.parse::<u64>().map_err(|e| {
                FlotillaError::InvalidConfig(format!(
                    "FLOTILLA_STARTUP_TIMEOUT_SECS must be a number of seconds: {}",
                    e
                ))
            })?;
        }
        if let Some(reuse) = var("FLOTILLA_REUSE_ENABLE") {
            self.reuse_enabled = parse_bool("FLOTILLA_REUSE_ENABLE", &reuse)?;
        }
        if let Some(mode) = var("FLOTILLA_START_MODE") {
            self.start_mode = mode.parse()?;
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(FlotillaError::InvalidConfig(format!(
            "{} must be a boolean (true/false/1/0)",
            name
        ))),
    }
}
