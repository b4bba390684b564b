//! Application configuration
//!
//! Every option has a default, so an empty or missing file is a valid
//! configuration. Precedence is CLI flags over environment over file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use obd_analysis::AiConfig;
use obd_core::{ReferenceCatalog, Severity};
use obd_link::LinkConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Environment variable toggling simulation mode
pub const ENV_SIMULATION: &str = "OBD_SIMULATION";
/// Environment variable overriding the per-call acquisition timeout
pub const ENV_TIMEOUT_MS: &str = "OBD_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// How long `end_session` waits for in-flight work after cancelling it
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            ai: AiConfig::default(),
            catalog: CatalogConfig::default(),
            storage: StorageConfig::default(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

impl AppConfig {
    /// Load from `path`, or from the default location when it exists
    ///
    /// An explicit path must exist; a missing default file yields the defaults.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// `<config_dir>/obdd/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("obdd").join("config.toml"))
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_SIMULATION) {
            match parse_flag(&value) {
                Some(simulation) => self.link.simulation = simulation,
                None => warn!(variable = ENV_SIMULATION, value = %value, "Ignoring invalid flag"),
            }
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.link.timeouts.acquisition_ms = ms,
                _ => warn!(variable = ENV_TIMEOUT_MS, value = %value, "Ignoring invalid timeout"),
            }
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Extra catalog merged over the built-in one
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Severity of codes missing from the catalog
    #[serde(default = "default_unknown_severity")]
    pub unknown_severity: Severity,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: None,
            unknown_severity: default_unknown_severity(),
        }
    }
}

fn default_unknown_severity() -> Severity {
    Severity::Medium
}

impl CatalogConfig {
    /// Built-in catalog, merged with the configured file
    pub fn build(&self) -> Result<Arc<ReferenceCatalog>> {
        let catalog = match &self.path {
            Some(path) => ReferenceCatalog::load(path)
                .with_context(|| format!("Failed to load catalog: {}", path.display()))?,
            None => ReferenceCatalog::builtin().context("Built-in catalog is invalid")?,
        };
        Ok(Arc::new(catalog.with_unknown_severity(self.unknown_severity)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[default]
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    /// Root directory for JSON session files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured directory, else `<data_dir>/obdd/sessions`
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("obdd")
                .join("sessions")
        })
    }
}
