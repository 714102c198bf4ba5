//! Gateway controller: composes the serial task, catalog and health state,
//! and exposes the programmatic surface the HTTP layer consumes.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{BusCommand, BusService, HealthInfo, HealthState, WriteOutcome};
use crate::core::catalog::{CatalogSnapshot, ParamCatalog, ParamSelector};
use crate::core::config::GatewayConfig;
use crate::core::transport::serial::{SerialFactory, SerialSettings};
use crate::core::transport::traits::TransportFactory;
use crate::utils::error::{GatewayError, Result};

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Owns the serial task and hands out snapshots, writes and health.
pub struct GatewayController {
    catalog: ParamCatalog,
    health: HealthState,
    commands: mpsc::Sender<BusCommand>,
    config: GatewayConfig,
    task: JoinHandle<()>,
}

impl GatewayController {
    /// Start the gateway over the configured serial device.
    pub fn start(config: GatewayConfig) -> Self {
        let factory = SerialFactory::new(SerialSettings {
            port: config.serial_port.clone(),
            baud_rate: config.serial_baud,
        });
        Self::start_with_factory(config, Box::new(factory))
    }

    /// Start the gateway over an arbitrary transport (tests use the mock
    /// bus here).
    pub fn start_with_factory(config: GatewayConfig, factory: Box<dyn TransportFactory>) -> Self {
        let catalog = ParamCatalog::new();
        let health = HealthState::new();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let service = BusService::new(
            config.clone(),
            factory,
            catalog.clone(),
            health.clone(),
            rx,
        );
        let task = tokio::spawn(service.run());

        Self {
            catalog,
            health,
            commands: tx,
            config,
            task,
        }
    }

    /// Consistent snapshot of every known parameter.
    pub async fn read_all(&self) -> CatalogSnapshot {
        self.catalog.snapshot().await
    }

    /// Submit a write and wait for its outcome.
    pub async fn write(
        &self,
        selector: ParamSelector,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(BusCommand::Write {
                selector,
                value,
                reply: tx,
            })
            .await
            .map_err(|_| GatewayError::internal("serial task is not running"))?;

        rx.await
            .map_err(|_| GatewayError::internal("serial task dropped the request"))?
    }

    pub async fn health(&self) -> HealthInfo {
        self.health
            .info(self.config.poll_interval(), self.catalog.len().await)
            .await
    }

    /// Stop the serial task. Pending queue entries are dropped.
    pub async fn shutdown(self) {
        drop(self.commands);
        self.task.abort();
        let _ = self.task.await;
    }
}
