/// Configuration management
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::services::cdc::PrimaryKeys;

/// Which change engine feeds the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Replay Debezium change values from a JSON-lines file
    #[default]
    Replay,
    /// Consume Debezium topics from Kafka (requires the `kafka` feature)
    Kafka,
}

/// Loader settings, read from `CDC_`-prefixed environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    /// Root directory of the local destination
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `table:column` pairs; tables listed here are merged, all others appended
    #[serde(default, deserialize_with = "deserialize_primary_keys")]
    pub primary_keys: PrimaryKeys,
    #[serde(default)]
    pub engine: EngineKind,
    /// Java-style properties file configuring the engine
    #[serde(default = "default_properties_file")]
    pub properties_file: PathBuf,
    /// Upper bound on how long the consumer waits before re-checking the stop flag
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Serve /health, /ready and /metrics on this port when set
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_pipeline_name() -> String {
    "mysql_cdc".to_string()
}

fn default_dataset_name() -> String {
    "mysql_cdc_data".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".cdc")
}

fn default_properties_file() -> PathBuf {
    PathBuf::from("debezium.properties")
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn deserialize_primary_keys<'de, D>(deserializer: D) -> std::result::Result<PrimaryKeys, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl LoaderConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed("CDC_").from_env::<Self>()?)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    /// Log configuration details
    pub fn log_config(&self) {
        info!(
            "CDC Loader Configuration: pipeline={}, dataset={}, data_dir={}, engine={:?}, \
             properties_file={}, poll_timeout={}ms, metrics_port={:?}",
            self.pipeline_name,
            self.dataset_name,
            self.data_dir.display(),
            self.engine,
            self.properties_file.display(),
            self.poll_timeout_ms,
            self.metrics_port
        );
        if self.primary_keys.is_empty() {
            info!("No primary keys configured, every table is appended");
        } else {
            info!(tables = ?self.primary_keys.tables(), "Primary keys configured for merge");
        }
    }
}

/// Engine properties in Java `.properties` form: `key=value` lines, `#`
/// comments and blank lines ignored, split on the first `=`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a properties file; a missing file yields no properties
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path).map_err(|e| {
            LoaderError::Properties(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self(entries)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| LoaderError::Properties(format!("Missing required property '{}'", key)))
    }

    /// Parse `key` as `T`, falling back to `default` when unset
    pub fn get_parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| {
                LoaderError::Properties(format!("Invalid value '{}' for '{}': {}", raw, key, e))
            }),
        }
    }

    /// Entries under `prefix`, with the prefix stripped
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.0.iter().filter_map(move |(key, value)| {
            key.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest, value.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("password") || key.contains("secret") || key.contains("sasl.jaas")
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(key, value)| {
                let shown = if is_sensitive(key) { "[REDACTED]" } else { value.as_str() };
                (key, shown)
            }))
            .finish()
    }
}
