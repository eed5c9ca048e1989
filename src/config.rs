//! Application configuration loaded from `config.yaml`.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. A few settings can be overridden from the environment:
//! `PORT`, `DATA_PATH` and `RKI_BASE_URL`.

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::application::{SnapshotConfig, StatisticsConfig};
use crate::domain::RawField;
use crate::infrastructure::SourceConfig;

/// Top-level application configuration.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Cells the source is known to have published wrongly; nulled after every update.
    #[serde(default)]
    pub known_outliers: Vec<KnownOutlier>,
}

/// Server configuration settings.
///
/// Defines how the HTTP server should bind and what CORS origins to allow.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on (default: 3010)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Comma-separated list of allowed CORS origins (default: "*")
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3010
}
fn default_allowed_origins() -> String {
    "*".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Parquet,
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory holding the table files
    #[serde(default = "default_data_path")]
    pub path: String,
    /// Table name, used as file stem
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_data_path() -> String {
    "data".to_string()
}
fn default_key() -> String {
    "cases_and_deaths".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_data_path(),
            key: default_key(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Seconds between update runs (default: one hour)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Run an update right after start-up
    #[serde(default = "default_run_on_start")]
    pub run_on_start: bool,
}

fn default_interval_secs() -> u64 {
    3600
}
fn default_run_on_start() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            run_on_start: default_run_on_start(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct KnownOutlier {
    pub date: NaiveDate,
    pub field: RawField,
}

impl Config {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse config.yaml - check YAML syntax and structure")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} - ensure file exists in working directory", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Apply `PORT`, `DATA_PATH` and `RKI_BASE_URL` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("DATA_PATH") {
            self.storage.path = path;
        }
        if let Some(url) = lookup("RKI_BASE_URL") {
            self.source.base_url = url;
        }
    }

    pub fn outlier_cells(&self) -> Vec<(NaiveDate, RawField)> {
        self.known_outliers.iter().map(|o| (o.date, o.field)).collect()
    }
}
