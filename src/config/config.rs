//! Ledger configuration management
//! Handles loading and saving the YAML config file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "WORKFLOW_LEDGER_CONFIG";

/// Ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Database path; a leading `~` is expanded to the home directory
    #[serde(default = "default_db_path")]
    pub database_path: String,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Rows fetched per page when streaming audit logs
    #[serde(default = "default_audit_page_size")]
    pub audit_page_size: usize,

    /// RPC server settings
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_db_path() -> String {
    "~/.workflow-ledger/ledger.db".to_string()
}

fn default_audit_page_size() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            pool: PoolConfig::default(),
            audit_page_size: default_audit_page_size(),
            server: ServerConfig::default(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// How long a writer waits on SQLite's lock before giving up
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
}

fn default_max_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_connection_timeout_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connection_timeout_secs: default_connection_timeout_secs(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9191
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Load config from the given path, the environment override or the
    /// default location. A missing file is created with defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(path)?;

        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Config::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        let config = Self::read_from(&config_path)?;
        debug!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Parse a config file without creating it
    pub fn read_from(config_path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;
        let config: Config = serde_yaml::from_str(&raw).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the resolved location
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = Self::config_path(path)?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = serde_yaml::to_string(&self)?;
        fs::write(config_path, content).context("Failed to write config file")?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the config file path: explicit path, then environment, then home
    fn config_path(path: Option<&str>) -> Result<PathBuf> {
        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(env_path));
        }

        let home = dirs::home_dir().context("Cannot find home directory")?;
        Ok(home.join(".workflow-ledger").join("config.yml"))
    }

    /// Resolve database path (expand a leading ~)
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        expand_home(&self.database_path)
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir().context("Cannot find home directory")?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}
