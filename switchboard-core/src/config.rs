//! Bus configuration, loaded from YAML files, `.env` files, and
//! environment variables.
//!
//! Resolution order (lowest to highest priority):
//!
//! 1. the YAML file handed to [`BusConfig::load`] (when present)
//! 2. `.env` (loaded into the process environment, never overwriting
//!    already-set variables)
//! 3. `SWITCHBOARD_*` environment variables

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

/// Error type for configuration operations. Configuration errors are fatal
/// at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O or YAML parsing error occurred while loading the file.
    Load(String),
    /// A value could not be interpreted.
    Invalid { key: String, detail: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Load(detail) => write!(f, "config load error: {detail}"),
            ConfigError::Invalid { key, detail } => {
                write!(f, "config value for '{key}' is invalid: {detail}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration for a bus client.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name identifying this bus process in hook payloads and logs.
    pub process_name: String,
    /// Default window for awaiting an RPC result when the call options
    /// carry no timeout of their own.
    pub rpc_timeout: Duration,
    /// Backoff applied after a transport fetch error before retrying.
    pub fetch_retry_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            process_name: generated_process_name(),
            rpc_timeout: Duration::from_secs(5),
            fetch_retry_delay: Duration::from_millis(250),
        }
    }
}

fn generated_process_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("proc-{}", &id[..8])
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    process_name: Option<String>,
    rpc_timeout_ms: Option<u64>,
    fetch_retry_delay_ms: Option<u64>,
}

impl RawConfig {
    fn into_config(self) -> Result<BusConfig, ConfigError> {
        let defaults = BusConfig::default();
        if self.rpc_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                key: "rpc_timeout_ms".into(),
                detail: "must be positive".into(),
            });
        }
        Ok(BusConfig {
            process_name: self.process_name.unwrap_or(defaults.process_name),
            rpc_timeout: self
                .rpc_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.rpc_timeout),
            fetch_retry_delay: self
                .fetch_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_retry_delay),
        })
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(text) => text
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                detail: format!("expected milliseconds, got '{text}'"),
            }),
        Err(_) => Ok(None),
    }
}

impl BusConfig {
    /// Load configuration from an optional YAML file, then overlay `.env`
    /// and `SWITCHBOARD_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut raw = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    ConfigError::Load(format!("reading {}: {err}", path.display()))
                })?;
                serde_yaml::from_str::<RawConfig>(&text).map_err(|err| {
                    ConfigError::Load(format!("parsing {}: {err}", path.display()))
                })?
            }
            _ => RawConfig::default(),
        };

        let _ = dotenvy::dotenv();

        if let Ok(name) = std::env::var("SWITCHBOARD_PROCESS_NAME") {
            raw.process_name = Some(name);
        }
        if let Some(ms) = env_u64("SWITCHBOARD_RPC_TIMEOUT_MS")? {
            raw.rpc_timeout_ms = Some(ms);
        }
        if let Some(ms) = env_u64("SWITCHBOARD_FETCH_RETRY_DELAY_MS")? {
            raw.fetch_retry_delay_ms = Some(ms);
        }

        raw.into_config()
    }

    /// Build a configuration from a YAML string. Useful for testing.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str::<RawConfig>(yaml)
            .map_err(|err| ConfigError::Load(err.to_string()))?
            .into_config()
    }

    /// Override the process name.
    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    /// Override the default RPC timeout.
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }
}
