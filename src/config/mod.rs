use crate::events::EventCategory;
use crate::transport::ManagerSettings;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamsConfig {
    /// Primary JSON-RPC stream WebSocket URL
    #[serde(default = "default_primary_ws_url")]
    pub primary_ws_url: String,
    /// Relay WebSocket URL. No fallback without it.
    #[serde(default)]
    pub relay_ws_url: Option<String>,
    /// Open the relay when the primary cannot be reached.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Retry a rejected primary subscription on the relay.
    #[serde(default = "default_true")]
    pub fallback_on_subscribe_failure: bool,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// How long an unused subscription stays live for a returning subscriber.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TailConfig {
    /// Categories to follow (empty = all).
    #[serde(default)]
    pub categories: Vec<EventCategory>,
    /// Only show records for this pool.
    #[serde(default)]
    pub pool_id: Option<String>,
    /// Wait before calling reconnect after the connection fails.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_primary_ws_url() -> String {
    "ws://127.0.0.1:8546".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_ping_interval() -> u64 {
    20
}
fn default_grace_period() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            primary_ws_url: default_primary_ws_url(),
            relay_ws_url: None,
            fallback_enabled: true,
            fallback_on_subscribe_failure: true,
            connect_timeout_ms: default_timeout_ms(),
            subscribe_timeout_ms: default_timeout_ms(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            pool_id: None,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl StreamsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            fallback_enabled: self.fallback_enabled,
            fallback_on_subscribe_failure: self.fallback_on_subscribe_failure,
        }
    }
}

impl RegistryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl TailConfig {
    /// Configured categories, or every category when none are listed.
    pub fn categories(&self) -> Vec<EventCategory> {
        if self.categories.is_empty() {
            EventCategory::ALL.to_vec()
        } else {
            let mut categories = self.categories.clone();
            categories.sort();
            categories.dedup();
            categories
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = var("POOLWATCH_PRIMARY_WS_URL") {
            self.streams.primary_ws_url = url;
        }
        if let Some(url) = var("POOLWATCH_RELAY_WS_URL") {
            self.streams.relay_ws_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(secs) = var("POOLWATCH_GRACE_PERIOD_SECS") {
            self.registry.grace_period_secs =
                secs.trim().parse().map_err(|e| ConfigError::Invalid {
                    field: "POOLWATCH_GRACE_PERIOD_SECS",
                    reason: format!("{e}"),
                })?;
        }
        Ok(())
    }

    /// Reject URLs that will never connect and zero timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ws_url("streams.primary_ws_url", &self.streams.primary_ws_url)?;
        if let Some(relay) = &self.streams.relay_ws_url {
            check_ws_url("streams.relay_ws_url", relay)?;
        }
        for (field, value) in [
            ("streams.connect_timeout_ms", self.streams.connect_timeout_ms),
            ("streams.subscribe_timeout_ms", self.streams.subscribe_timeout_ms),
            ("streams.ping_interval_secs", self.streams.ping_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

fn check_ws_url(field: &'static str, raw: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{raw}: {e}"),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("expected ws:// or wss://, got {other}://"),
        }),
    }
}
