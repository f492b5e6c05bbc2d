//! Configuration loading for quartermaster.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mcp::ServerConfig;
use runtime::Settings;
use serde::Deserialize;
use variety::{EnvironmentSnapshot, SystemSnapshot, VarietyConfig};

use crate::error::{Error, Result};

/// Full quartermaster configuration (`quartermaster.toml`).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Package catalogs queried by discovery. Defaults to the public npm
    /// registry when empty.
    pub catalogs: Vec<CatalogConfig>,

    /// Tool servers started at boot.
    pub servers: Vec<ToolServerConfig>,

    /// Operator-declared environment model for the variety calculator.
    pub environment: EnvironmentSnapshot,

    /// Weights and critical-area rules.
    pub variety: VarietyConfig,

    /// Capability counts contributed by collaborators outside the
    /// supervisor's own view.
    pub baseline: SystemSnapshot,

    /// Event journal location. Defaults to the platform data directory.
    pub journal: Option<PathBuf>,
}

/// One package catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub name: String,
    pub url: String,
}

/// A preconfigured tool server from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ToolServerConfig {
    /// Apply the runtime's supervision defaults to this entry.
    pub fn to_server_config(&self, settings: &Settings) -> ServerConfig {
        let mut config = ServerConfig::new(&self.command);
        config.name = self.name.clone();
        config.args = self.args.clone();
        config.env = self.env.clone();
        config.cwd = self.cwd.clone();
        config.restart_policy = settings.restart_policy;
        config.health_interval = settings.health_interval;
        config.init_timeout = settings.init_timeout;
        config
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse config from TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Configured catalogs, falling back to the public npm registry.
    pub fn catalogs(&self) -> Vec<CatalogConfig> {
        if self.catalogs.is_empty() {
            vec![CatalogConfig {
                name: "npm".to_string(),
                url: "https://registry.npmjs.org".to_string(),
            }]
        } else {
            self.catalogs.clone()
        }
    }

    /// Server configs with supervision defaults applied.
    pub fn server_configs(&self, settings: &Settings) -> Vec<ServerConfig> {
        self.servers
            .iter()
            .map(|s| s.to_server_config(settings))
            .collect()
    }
}
