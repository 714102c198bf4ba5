//! Bus engines: discovery, polling and writes, plus the serial task that
//! drives them and the gateway controller composing everything.

pub mod discovery;
pub mod gateway;
pub mod health;
pub mod polling;
pub mod service;
pub mod write;

use crate::core::config::GatewayConfig;

/// The slice of configuration the engines need on every bus exchange.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub controller_address: u16,
    pub params_per_request: u16,
}

impl From<&GatewayConfig> for EngineConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            controller_address: config.destination_address,
            params_per_request: config.params_per_request,
        }
    }
}

pub use gateway::GatewayController;
pub use health::{HealthInfo, HealthState, HealthStatusKind};
pub use service::{BusCommand, BusService};
pub use write::WriteOutcome;
