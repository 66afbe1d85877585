//! Configuration.
//!
//! Loaded from a TOML file at, in order:
//! 1. `--config PATH`
//! 2. `./mist.toml`
//! 3. `<config dir>/mist/mist.toml` (`~/.config/mist/mist.toml` on Linux)
//!
//! Missing files fall back to built-in defaults, except an explicit
//! `--config` which must exist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mist_import::ImportOptions;
use mist_mail::SourceConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "mist.toml";
const APP_DIR: &str = "mist";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub store: StoreConfig,
    pub import: ImportConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// "error", "warn", "info", "debug" or "trace".
    pub log_level: String,
    /// Override for the token store and log file location.
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    /// When false every unit of work is rolled back.
    pub commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            commit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub source_timeout_secs: u64,
    pub max_concurrent_sources: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let defaults = ImportOptions::default();
        Self {
            source_timeout_secs: defaults.source_timeout.as_secs(),
            max_concurrent_sources: defaults.max_concurrent_sources,
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for source in &self.sources {
            if !ids.insert(source.id) {
                bail!("duplicate source id {}", source.id);
            }
            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name '{}'", source.name);
            }
        }
        Ok(())
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            source_timeout: Duration::from_secs(self.import.source_timeout_secs),
            max_concurrent_sources: self.import.max_concurrent_sources,
            ..ImportOptions::default()
        }
    }

    pub fn source_named(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Sources to import: all of them when `names` is empty, otherwise the
    /// named ones in configured order. Unknown names are logged and ignored.
    pub fn select_sources(&self, names: &[String]) -> Vec<SourceConfig> {
        for name in names {
            if self.source_named(name).is_none() {
                warn!("no source named '{}' in the configuration", name);
            }
        }
        self.sources
            .iter()
            .filter(|s| names.is_empty() || names.iter().any(|n| *n == s.name))
            .cloned()
            .collect()
    }
}

pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .filter(|path| path.exists())
}

pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let Some(path) = config_path(explicit) else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Config::parse(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Directory for the token store and the log file.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(dir) = &config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".mist"))
}
