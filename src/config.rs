use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::autolink::{
    ports::RetryStrategy,
    retry::{ExponentialBackoff, ImmediateRetry},
    router::{DEFAULT_LINK_CAPACITY, RouterOptions},
    types::{AutolinkSpec, ContainerId, PairingPolicy, WaypointDeclaration},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub containers: Vec<ContainerEndpointConfig>,
    #[serde(default)]
    pub addresses: Vec<WaypointDeclaration>,
    #[serde(default)]
    pub autolinks: Vec<AutolinkSpec>,
}

fn default_enabled_true() -> bool {
    true
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs/router")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_logging_retention_days() -> usize {
    14
}

fn default_link_capacity() -> u32 {
    DEFAULT_LINK_CAPACITY
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_listener_bind() -> String {
    "127.0.0.1:5672".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default = "default_logging_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_enabled_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: default_logging_rotation(),
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_link_capacity")]
    pub link_capacity: u32,
    #[serde(default)]
    pub pairing_policy: PairingPolicy,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            link_capacity: default_link_capacity(),
            pairing_policy: PairingPolicy::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn options(&self) -> RouterOptions {
        RouterOptions {
            link_capacity: self.link_capacity,
            pairing_policy: self.pairing_policy,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectConfig {
    #[default]
    Immediate,
    Backoff {
        #[serde(default = "default_backoff_base_ms")]
        base_ms: u64,
        #[serde(default = "default_backoff_max_ms")]
        max_ms: u64,
    },
}

impl ReconnectConfig {
    pub fn strategy(&self) -> Arc<dyn RetryStrategy> {
        match self {
            ReconnectConfig::Immediate => Arc::new(ImmediateRetry),
            ReconnectConfig::Backoff { base_ms, max_ms } => {
                Arc::new(ExponentialBackoff::new(*base_ms, *max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listener_bind")]
    pub bind: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_listener_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEndpointConfig {
    pub container_id: ContainerId,
    pub connect: String,
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(config_value).context("failed to deserialize router config")?;
        if !config.logging.dir.is_absolute() {
            config.logging.dir = config_base.join(&config.logging.dir);
        }
        config.validate()?;

        Ok(config)
    }

    /// Cross-field checks the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        let endpoints = self.container_endpoints()?;
        for spec in &self.autolinks {
            if !endpoints.contains_key(&spec.container_id) {
                bail!(
                    "autolink '{}' names container '{}' with no entry in containers",
                    spec.address,
                    spec.container_id
                );
            }
        }
        Ok(())
    }

    pub fn container_endpoints(&self) -> Result<BTreeMap<ContainerId, String>> {
        let mut endpoints = BTreeMap::new();
        for container in &self.containers {
            if endpoints
                .insert(container.container_id.clone(), container.connect.clone())
                .is_some()
            {
                bail!(
                    "container '{}' is declared more than once",
                    container.container_id
                );
            }
        }
        Ok(endpoints)
    }
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let local_default = config_base.join("autolink-router.schema.json");
    if local_default.exists() {
        return Ok(local_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or autolink-router.schema.json"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
