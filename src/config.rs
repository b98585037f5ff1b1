use std::fmt;
use std::time::Duration;

use config::{builder::DefaultState, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub schema: String,
    pub heartbeat_secs: u64,
    pub join_timeout_secs: u64,
    /// PEM bundle to trust instead of the bundled web roots.
    pub ca_file: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            schema: "public".to_string(),
            heartbeat_secs: 25,
            join_timeout_secs: 10,
            ca_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Delay before an unused channel is closed; 0 closes immediately.
    pub close_grace_ms: u64,
    pub emergency_mode: bool,
}

impl SubscriptionConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_secs: u64,
    pub stale_after_secs: u64,
    pub stale_after_disconnected_secs: u64,
    pub token_refresh_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stale_after_secs: 300,
            stale_after_disconnected_secs: 30,
            token_refresh_after_secs: 600,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stale_after_disconnected(&self) -> Duration {
        Duration::from_secs(self.stale_after_disconnected_secs)
    }

    pub fn token_refresh_after(&self) -> Duration {
        Duration::from_secs(self.token_refresh_after_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub realtime: RealtimeConfig,
    pub subscriptions: SubscriptionConfig,
    pub health: HealthConfig,
    pub retry: RetryPolicy,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load `config.toml` (optional) and `REALTIME_*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("config")
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut builder: ConfigBuilder<DefaultState> = ConfigBuilder::default();

        builder = builder.add_source(File::with_name(path).required(false));
        // REALTIME_HEALTH__POLL_INTERVAL_SECS=10
        builder = builder.add_source(
            Environment::with_prefix("REALTIME")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = ConfigBuilder::<DefaultState>::default()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.health.stale_after_disconnected_secs >= self.health.stale_after_secs {
            return Err(ConfigError::Message(format!(
                "health.stale_after_disconnected_secs ({}) must be shorter than health.stale_after_secs ({})",
                self.health.stale_after_disconnected_secs, self.health.stale_after_secs
            )));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(ConfigError::Message("health.poll_interval_secs must be positive".to_string()));
        }
        if self.realtime.heartbeat_secs == 0 {
            return Err(ConfigError::Message("realtime.heartbeat_secs must be positive".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "realtime={} schema={} poll={}s stale={}s/{}s emergency={}",
            self.realtime.url,
            self.realtime.schema,
            self.health.poll_interval_secs,
            self.health.stale_after_secs,
            self.health.stale_after_disconnected_secs,
            self.subscriptions.emergency_mode
        )
    }
}
