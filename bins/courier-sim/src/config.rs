use courier_core::config::EngineConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Who talks to whom, and how long the backend stays unreachable.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_recipients")]
    pub recipients: Vec<String>,
    #[serde(default = "default_devices")]
    pub devices_per_recipient: usize,
    #[serde(default = "default_offline_ms")]
    pub offline_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            sender: default_sender(),
            recipients: default_recipients(),
            devices_per_recipient: default_devices(),
            offline_ms: default_offline_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_sender() -> String {
    "alice".to_string()
}

fn default_recipients() -> Vec<String> {
    vec!["bob".to_string(), "carol".to_string()]
}

fn default_devices() -> usize {
    2
}

fn default_offline_ms() -> u64 {
    1_500
}

fn default_settle_ms() -> u64 {
    10_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("engine: {0}")]
    Engine(#[from] courier_core::config::ConfigError),
    #[error("scenario: {0}")]
    Scenario(&'static str),
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.scenario.recipients.is_empty() {
            return Err(ConfigError::Scenario("no recipients"));
        }
        if self.scenario.devices_per_recipient == 0 {
            return Err(ConfigError::Scenario("devices_per_recipient"));
        }
        if self
            .scenario
            .recipients
            .iter()
            .any(|r| r.trim_start_matches('@') == self.scenario.sender.trim_start_matches('@'))
        {
            return Err(ConfigError::Scenario("sender listed as recipient"));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<SimConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let cfg: SimConfig = toml::from_str(&content)?;
    cfg.validate()?;
    Ok(cfg)
}
