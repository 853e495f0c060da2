//! Configuration management with file persistence

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::jobs::WorkerConfig;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseSettings,
    pub worker: WorkerConfig,
    pub merge: MergeSettings,
}

/// Database settings (a serializable subset of the pool config)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Path to the SQLite database file; None uses the platform default
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
            auto_migrate: true,
        }
    }
}

/// Merge service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// How long a merge waits on a contended pair lock
    pub lock_wait_ms: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self { lock_wait_ms: 5000 }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration to a TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Resolve the database pool configuration
    pub fn database_config(&self) -> crate::storage::DatabaseConfig {
        let mut config = match &self.database.path {
            Some(path) => crate::storage::DatabaseConfig::with_path(path.clone()),
            None => crate::storage::DatabaseConfig::default(),
        };
        config.max_connections = self.database.max_connections;
        config.auto_migrate = self.database.auto_migrate;
        config
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("lattice").join("config.toml")
    } else {
        PathBuf::from("lattice.toml")
    }
}
