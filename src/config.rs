//! Configuration file loading: `~/.config/gotmuch/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    /// Path to the metadata database. Defaults to
    /// `~/.local/share/gotmuch/gotmuch.db`.
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Root of the local mail store this tool writes message files into.
    /// Defaults to notmuch's `database.path`.
    #[serde(default)]
    pub store_root: Option<PathBuf>,
    #[serde(default)]
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account email address. Doubles as the scope keying database rows and
    /// blob filenames, so multi-account stores stay disjoint.
    pub email: String,
    /// Shell command printing a fresh Gmail access token on stdout, e.g. an
    /// oauth2 helper invocation. Checked after GOTMUCH_ACCESS_TOKEN.
    #[serde(default)]
    pub token_command: Option<String>,
}

/// Remote API quota budget. The service allows 250 quota units per second;
/// the defaults spend 80% of that steadily with a burst of the full budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_rate_per_second")]
    pub per_second: f64,
    #[serde(default = "default_rate_burst")]
    pub burst: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_second: default_rate_per_second(),
            burst: default_rate_burst(),
        }
    }
}

fn default_rate_per_second() -> f64 {
    200.0
}

fn default_rate_burst() -> f64 {
    250.0
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not determine the config directory")?;
        Ok(dir.join("gotmuch"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// The metadata database location, configured or default.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let dir = dirs::data_local_dir().context("Could not determine the data directory")?;
        Ok(dir.join("gotmuch").join("gotmuch.db"))
    }

    /// Create the directory the database lives in.
    pub fn ensure_dirs(&self) -> Result<()> {
        let db = self.database_path()?;
        if let Some(parent) = db.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}
