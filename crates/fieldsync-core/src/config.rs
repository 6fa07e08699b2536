use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BATCH_LIMIT: i64 = 200;

fn default_local_only_tables() -> Vec<String> {
    vec![
        "pending_assets".into(),
        "provisional_checklist_items".into(),
        "mutation_log".into(),
    ]
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct StoreConfig {
    /// Directory holding the local SQLite database.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Directory captured assets are written to; also searched when a queued
    /// asset's recorded path has gone missing.
    #[serde(default)]
    pub assets_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SyncConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub drain_interval_secs: u64,
    /// Maximum mutations forwarded per drain.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    /// Tables that exist only on the device and are never forwarded upstream.
    #[serde(default = "default_local_only_tables")]
    pub local_only_tables: Vec<String>,
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_batch_limit() -> i64 {
    DEFAULT_BATCH_LIMIT
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            drain_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            local_only_tables: default_local_only_tables(),
        }
    }
}

impl SyncConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct RemoteConfig {
    /// Base URL of the remote data service, e.g. <https://project.example.com>.
    /// When unset the engine runs against an in-process remote.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Blob storage bucket for captured assets (defaults to "photos").
    #[serde(default)]
    pub bucket: Option<String>,
    /// Name of the environment variable holding the service key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    pub fn state_dir(&self) -> PathBuf {
        self.store
            .state_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("state"))
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.store
            .assets_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir().join("assets"))
    }
}

static CONFIG_SCHEMA: Lazy<Option<Validator>> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).ok()
});

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).unwrap_or_default()
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    if let Some(validator) = CONFIG_SCHEMA.as_ref() {
        let validation_errors: Vec<_> = validator
            .iter_errors(&json_value)
            .map(|e| e.to_string())
            .collect();
        if !validation_errors.is_empty() {
            return Err(anyhow::anyhow!(validation_errors.join(", ")));
        }
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
