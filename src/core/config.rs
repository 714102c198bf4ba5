//! Gateway configuration.
//!
//! Figment-layered: built-in defaults, then an optional YAML file, then
//! environment variables. The environment is the primary interface on a
//! deployed gateway (`SERIAL_PORT`, `POLL_INTERVAL`, ...); the YAML file is
//! a convenience for development setups.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::utils::error::{GatewayError, Result};

/// Environment variables recognised by the gateway.
const ENV_KEYS: &[&str] = &[
    "serial_port",
    "serial_baud",
    "api_host",
    "api_port",
    "poll_interval",
    "token_required",
    "destination_address",
    "request_timeout",
    "params_per_request",
    "state_dir",
    "log_level",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Serial device path
    pub serial_port: String,
    /// Serial baud rate (8-N-1 is fixed)
    pub serial_baud: u32,
    /// HTTP bind host
    pub api_host: String,
    /// HTTP bind port
    pub api_port: u16,
    /// Seconds between polling cycles
    pub poll_interval: f64,
    /// When false, fall back to opportunistic transmission after bus idle
    pub token_required: bool,
    /// Controller bus address
    pub destination_address: u16,
    /// Seconds to wait for a reply per request attempt
    pub request_timeout: f64,
    /// Parameters per GET_PARAMS page (lower for timing headroom)
    pub params_per_request: u16,
    /// Directory holding persisted state (the `paired_address` file)
    pub state_dir: PathBuf,
    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/econext".to_string(),
            serial_baud: 115_200,
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            poll_interval: 10.0,
            token_required: true,
            destination_address: 1,
            request_timeout: 1.5,
            params_per_request: 100,
            state_dir: PathBuf::from("/var/lib/gm3srv"),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then the optional YAML file, then
    /// environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Yaml::file(path));
        }
        let config: GatewayConfig = figment.merge(Env::raw().only(ENV_KEYS)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial_port.is_empty() {
            return Err(GatewayError::config("serial_port cannot be empty"));
        }
        if self.serial_baud == 0 {
            return Err(GatewayError::config("serial_baud must be greater than zero"));
        }
        if self.poll_interval <= 0.0 {
            return Err(GatewayError::config("poll_interval must be positive"));
        }
        if self.request_timeout <= 0.0 {
            return Err(GatewayError::config("request_timeout must be positive"));
        }
        if self.params_per_request == 0 {
            return Err(GatewayError::config(
                "params_per_request must be greater than zero",
            ));
        }
        if self.destination_address == 0xFFFF {
            return Err(GatewayError::config(
                "destination_address cannot be the broadcast address",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn api_bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}
