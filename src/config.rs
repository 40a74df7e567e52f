use crate::control::policy::DEFAULT_PROTECTED_PROCESSES;
use crate::engine::SettingsProvider;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MAX_HISTORY_CAPACITY: usize = 3600;
pub const MAX_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_protected_processes")]
    pub protected_processes: Vec<String>,
    #[serde(default = "default_service_settle_delay_ms")]
    pub service_settle_delay_ms: u64,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alerts_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cpu_load_threshold_percent")]
    pub cpu_load_threshold_percent: f64,
    #[serde(default = "default_ram_usage_threshold_percent")]
    pub ram_usage_threshold_percent: f64,
    #[serde(default = "default_disk_usage_threshold_percent")]
    pub disk_usage_threshold_percent: f64,
    #[serde(default = "default_gpu_load_threshold_percent")]
    pub gpu_load_threshold_percent: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            history_capacity: default_history_capacity(),
            protected_processes: default_protected_processes(),
            service_settle_delay_ms: default_service_settle_delay_ms(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: default_alerts_enabled(),
            cpu_load_threshold_percent: default_cpu_load_threshold_percent(),
            ram_usage_threshold_percent: default_ram_usage_threshold_percent(),
            disk_usage_threshold_percent: default_disk_usage_threshold_percent(),
            gpu_load_threshold_percent: default_gpu_load_threshold_percent(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn is_missing_file(&self) -> bool {
        matches!(self, ConfigError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if !(1..=MAX_INTERVAL_SECS).contains(&self.interval_secs) {
            return Err(ConfigError::Validation(format!(
                "interval_secs must be in 1..={MAX_INTERVAL_SECS}"
            )));
        }
        if !(1..=MAX_HISTORY_CAPACITY).contains(&self.history_capacity) {
            return Err(ConfigError::Validation(format!(
                "history_capacity must be in 1..={MAX_HISTORY_CAPACITY}"
            )));
        }

        validate_protected(&self.protected_processes)?;
        validate_alerts(&self.alerts)?;

        Ok(())
    }

    pub fn service_settle_delay(&self) -> Duration {
        Duration::from_millis(self.service_settle_delay_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl SettingsProvider for Config {
    fn refresh_interval_seconds(&self) -> u64 {
        self.interval_secs
    }

    fn history_capacity(&self) -> usize {
        self.history_capacity
    }
}

fn validate_protected(names: &[String]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Err(ConfigError::Validation(
                "protected_processes entries must not be empty".to_string(),
            ));
        }
        if key.matches('*').count() > 1 {
            return Err(ConfigError::Validation(format!(
                "protected_processes entry '{name}' may contain at most one '*'"
            )));
        }
        if !seen.insert(key) {
            return Err(ConfigError::Validation(format!(
                "protected_processes entry '{name}' is listed twice"
            )));
        }
    }
    Ok(())
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    for (field, value) in [
        ("cpu_load_threshold_percent", cfg.cpu_load_threshold_percent),
        ("ram_usage_threshold_percent", cfg.ram_usage_threshold_percent),
        ("disk_usage_threshold_percent", cfg.disk_usage_threshold_percent),
        ("gpu_load_threshold_percent", cfg.gpu_load_threshold_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "alerts.{field} must be in 0..100"
            )));
        }
    }
    if cfg.cooldown_secs < 1 {
        return Err(ConfigError::Validation(
            "alerts.cooldown_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

const fn default_interval_secs() -> u64 {
    2
}

const fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_protected_processes() -> Vec<String> {
    DEFAULT_PROTECTED_PROCESSES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

const fn default_service_settle_delay_ms() -> u64 {
    1000
}

const fn default_alerts_enabled() -> bool {
    true
}

const fn default_cpu_load_threshold_percent() -> f64 {
    90.0
}

const fn default_ram_usage_threshold_percent() -> f64 {
    90.0
}

const fn default_disk_usage_threshold_percent() -> f64 {
    95.0
}

const fn default_gpu_load_threshold_percent() -> f64 {
    95.0
}

const fn default_cooldown_secs() -> u64 {
    60
}
