use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bus: BusConfig,
    pub protocol: ProtocolConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of published messages retained for inspection. Oldest entries
    /// are evicted once the capacity is reached.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub version: String,
    /// Fallback budget for request/response calls that do not pass an
    /// explicit timeout.
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bound on the per-agent operation log.
    pub operation_log_capacity: usize,
    /// Idle window after which an agent is considered stale.
    pub stale_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            default_timeout_ms: 5000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            operation_log_capacity: 100,
            stale_after_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            protocol: ProtocolConfig::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Config::builder()
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(Environment::with_prefix("AGORA").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
