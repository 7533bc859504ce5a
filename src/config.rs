// ⚙️ Configuration
//
// Loaded from a TOML file; every field has a default so a missing file or a
// partial file both work.

use anyhow::{Context as _, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "quotaholder.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database: PathBuf,

    /// Root of the ownership tree; bootstrapped on first open
    pub admin_entity: String,

    /// Key the admin entity is created with
    pub admin_key: String,

    /// Resolved commissions older than this are eligible for purge
    pub commission_retention_days: i64,

    /// tracing EnvFilter directive, overridden by RUST_LOG
    pub log_filter: String,

    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database: PathBuf::from("quotaholder.db"),
            admin_entity: "system".to_string(),
            admin_key: String::new(),
            commission_retention_days: 30,
            log_filter: "info".to_string(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:3000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(EngineConfig::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::entity::validate_name("admin entity", &self.admin_entity)?;
        if self.commission_retention_days < 0 {
            anyhow::bail!(
                "commission_retention_days must not be negative ({})",
                self.commission_retention_days
            );
        }
        if self.retention().is_none() {
            anyhow::bail!(
                "commission_retention_days is out of range ({})",
                self.commission_retention_days
            );
        }
        Ok(())
    }

    /// Retention window, or None when the purge cutoff would fall outside
    /// the representable date range
    pub fn retention(&self) -> Option<Duration> {
        let retention = Duration::try_days(self.commission_retention_days)?;
        Utc::now().checked_sub_signed(retention)?;
        Some(retention)
    }
}
