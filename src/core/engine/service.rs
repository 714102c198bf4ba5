//! The serial task.
//!
//! One long-running task owns the serial port, the bus arbiter and all
//! catalog mutation. Discovery runs once at startup, polling on a timer,
//! and write requests arrive through an mpsc queue from the HTTP layer.
//! Within the task, operations are strictly FIFO; the 20 ms bus turnaround
//! only holds because there is exactly one sender.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{discovery, polling, write, EngineConfig, HealthState, WriteOutcome};
use crate::core::bus::address_book::AddressBook;
use crate::core::bus::arbiter::{ArbiterConfig, BusArbiter};
use crate::core::catalog::{ParamCatalog, ParamSelector};
use crate::core::config::GatewayConfig;
use crate::core::transport::link::FrameLink;
use crate::core::transport::traits::TransportFactory;
use crate::utils::error::{GatewayError, Result};

/// Delay between reconnection attempts after transport loss.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// How long a queued write may wait for a token before giving up.
const WRITE_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests submitted to the serial task.
pub enum BusCommand {
    Write {
        selector: ParamSelector,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<WriteOutcome>>,
    },
}

/// The serial task body. Constructed by the gateway controller and consumed
/// by `run()`.
pub struct BusService {
    config: GatewayConfig,
    engine: EngineConfig,
    factory: Box<dyn TransportFactory>,
    catalog: ParamCatalog,
    health: HealthState,
    commands: mpsc::Receiver<BusCommand>,
}

impl BusService {
    pub fn new(
        config: GatewayConfig,
        factory: Box<dyn TransportFactory>,
        catalog: ParamCatalog,
        health: HealthState,
        commands: mpsc::Receiver<BusCommand>,
    ) -> Self {
        let engine = EngineConfig::from(&config);
        Self {
            config,
            engine,
            factory,
            catalog,
            health,
            commands,
        }
    }

    pub async fn run(mut self) {
        let book = AddressBook::load(&self.config.state_dir);

        let Some(mut arbiter) = self.connect_first(book).await else {
            return; // command channel closed before the port ever opened
        };

        self.ensure_discovered(&mut arbiter).await;

        let mut poll_timer = tokio::time::interval(self.config.poll_interval());
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => self.handle_command(&mut arbiter, command).await,
                        None => {
                            info!("Command channel closed, serial task exiting");
                            return;
                        }
                    }
                }
                _ = poll_timer.tick() => {
                    self.poll_once(&mut arbiter).await;
                }
            }
        }
    }

    /// Open the port for the first time, retrying until it appears. Returns
    /// `None` when the command channel closes while waiting (shutdown).
    async fn connect_first(&mut self, book: AddressBook) -> Option<BusArbiter> {
        loop {
            match self.factory.open().await {
                Ok(transport) => {
                    self.health.set_connected(true).await;
                    let arbiter_config = ArbiterConfig {
                        token_required: self.config.token_required,
                        request_timeout: self.config.request_timeout(),
                    };
                    return Some(BusArbiter::new(
                        FrameLink::new(transport),
                        book,
                        arbiter_config,
                    ));
                }
                Err(e) => {
                    error!("Cannot open serial transport: {e}");
                    self.health.set_connected(false).await;
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        maybe_command = self.commands.recv() => {
                            match maybe_command {
                                Some(command) => Self::reject_command(
                                    command,
                                    GatewayError::Disconnected("serial port unavailable".into()),
                                ),
                                None => return None,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Close-and-reopen with backoff after transport loss. The catalog and
    /// claimed address survive; any held token is gone with the connection.
    async fn reconnect(&mut self, arbiter: &mut BusArbiter) {
        self.health.set_connected(false).await;
        loop {
            warn!("Serial transport lost, reopening in {:?}", RECONNECT_DELAY);
            tokio::time::sleep(RECONNECT_DELAY).await;
            match self.factory.open().await {
                Ok(transport) => {
                    arbiter.swap_transport(transport);
                    self.health.set_connected(true).await;
                    info!("Serial transport reopened");
                    return;
                }
                Err(e) => error!("Reopen failed: {e}"),
            }
        }
    }

    /// Run discovery until the catalog has content.
    async fn ensure_discovered(&mut self, arbiter: &mut BusArbiter) {
        while self.catalog.is_empty().await {
            let catalog = self.catalog.clone();
            let engine = self.engine.clone();
            let result = arbiter
                .run_with_token(None, move |bus| {
                    Box::pin(async move { discovery::run(bus, &catalog, &engine).await })
                })
                .await;

            match result {
                Ok(report) => {
                    self.note_bus_activity(arbiter).await;
                    if report.total() == 0 {
                        warn!("Discovery returned no parameters, retrying next cycle");
                        tokio::time::sleep(self.config.poll_interval()).await;
                    }
                }
                Err(e) if e.is_transport() => {
                    error!("Transport lost during discovery: {e}");
                    self.reconnect(arbiter).await;
                }
                Err(e) => {
                    warn!("Discovery failed ({e}), retrying next cycle");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    async fn poll_once(&mut self, arbiter: &mut BusArbiter) {
        if self.catalog.is_empty().await {
            self.ensure_discovered(arbiter).await;
        }

        let catalog = self.catalog.clone();
        let engine = self.engine.clone();
        let result = arbiter
            .run_with_token(Some(self.config.poll_interval()), move |bus| {
                Box::pin(async move { polling::poll_cycle(bus, &catalog, &engine).await })
            })
            .await;

        match result {
            Ok(updated) => {
                debug!("Poll cycle updated {updated} values");
                self.health.record_poll(chrono::Utc::now()).await;
                self.note_bus_activity(arbiter).await;
            }
            Err(GatewayError::TokenTimeout) => {
                warn!("No bus token this cycle, poll skipped");
            }
            Err(e) if e.is_transport() => {
                error!("Transport lost during poll: {e}");
                self.reconnect(arbiter).await;
            }
            Err(e) => warn!("Poll cycle failed: {e}"),
        }
    }

    async fn handle_command(&mut self, arbiter: &mut BusArbiter, command: BusCommand) {
        match command {
            BusCommand::Write {
                selector,
                value,
                reply,
            } => {
                // A request abandoned before we touch the bus is dropped
                // without side effects.
                if reply.is_closed() {
                    debug!("Write request for {selector} cancelled before processing");
                    return;
                }
                let result = self.execute_write(arbiter, &selector, &value).await;
                if reply.send(result).is_err() {
                    debug!("Write requester for {selector} went away");
                }
            }
        }
    }

    async fn execute_write(
        &mut self,
        arbiter: &mut BusArbiter,
        selector: &ParamSelector,
        value: &serde_json::Value,
    ) -> Result<WriteOutcome> {
        let Some(param) = self.catalog.resolve(selector).await else {
            return Err(GatewayError::ParameterNotFound(selector.to_string()));
        };

        // Semantic validation happens before any bus traffic; rejected
        // writes never transmit.
        let encoded = write::validate(&param, value)?;

        let catalog = self.catalog.clone();
        let engine = self.engine.clone();
        let result = arbiter
            .run_with_token(Some(WRITE_TOKEN_TIMEOUT), move |bus| {
                Box::pin(async move {
                    write::execute(bus, &catalog, &engine, &param, encoded).await
                })
            })
            .await;

        if let Err(e) = &result {
            if e.is_transport() {
                error!("Transport lost during write: {e}");
                self.reconnect(arbiter).await;
            }
        } else {
            self.note_bus_activity(arbiter).await;
        }
        result
    }

    async fn note_bus_activity(&self, arbiter: &BusArbiter) {
        self.health
            .record_frame_activity(arbiter.link_stats().last_frame_at)
            .await;
    }

    fn reject_command(command: BusCommand, error: GatewayError) {
        match command {
            BusCommand::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}
