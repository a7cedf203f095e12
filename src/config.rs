use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

use crate::hub::lifecycle::LifecycleConfig;
use crate::wire::ParamNames;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub hub: HubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub verification_timeout_secs: u64,
    pub challenge_ttl_secs: u64,
    pub delivery_timeout_secs: u64,
    /// 0 (the default) means unbounded.
    pub max_concurrent_deliveries: usize,
    pub default_lease_seconds: Option<u32>,
    pub max_lease_seconds: Option<u32>,
    /// Advertised to subscribers as the hub's own URL.
    pub public_url: Option<String>,
    #[serde(default)]
    pub names: ParamNames,
}

impl HubConfig {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        (self.max_concurrent_deliveries > 0).then_some(self.max_concurrent_deliveries)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            verification_timeout: self.verification_timeout(),
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            default_lease_seconds: self.default_lease_seconds,
            max_lease_seconds: self.max_lease_seconds,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_SERVER__HOST or APP_HUB__DELIVERY_TIMEOUT_SECS
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("hub.verification_timeout_secs", 10)?
            .set_default("hub.challenge_ttl_secs", 30)?
            .set_default("hub.delivery_timeout_secs", 30)?
            .set_default("hub.max_concurrent_deliveries", 0)
    }
}
