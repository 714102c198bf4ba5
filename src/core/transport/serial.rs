//! Serial port transport.
//!
//! Opening applies a "baud toggle reset": the port is first opened at 9600
//! baud, closed, then reopened at the target rate. Some USB RS-485 adapters
//! latch up until they see a rate change; the reset is an observed hardware
//! quirk, not a protocol requirement.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::traits::{ByteTransport, TransportFactory};
use crate::utils::error::{GatewayError, Result};

/// Serial port settings (always 8-N-1, no flow control on the GM3 bus).
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
}

/// Serial transport over a tokio-serial stream.
pub struct SerialTransport {
    stream: SerialStream,
    settings: SerialSettings,
}

impl SerialTransport {
    /// Open the serial device, applying the baud toggle reset first.
    pub async fn open(settings: SerialSettings) -> Result<Self> {
        debug!("Baud toggle reset on {}", settings.port);
        {
            let reset = tokio_serial::new(&settings.port, 9600)
                .open_native_async()
                .map_err(|e| {
                    GatewayError::PortUnavailable(format!(
                        "failed to open {}: {e}",
                        settings.port
                    ))
                })?;
            drop(reset);
        }

        let mut stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                GatewayError::PortUnavailable(format!("failed to open {}: {e}", settings.port))
            })?;

        #[cfg(unix)]
        stream.set_exclusive(false).map_err(|e| {
            GatewayError::PortUnavailable(format!("failed to set exclusive mode: {e}"))
        })?;

        info!(
            "Opened serial port {} at {} baud",
            settings.port, settings.baud_rate
        );

        Ok(Self { stream, settings })
    }
}

#[async_trait]
impl ByteTransport for SerialTransport {
    async fn read_chunk(&mut self, buf: &mut [u8], read_timeout: Duration) -> Result<usize> {
        match timeout(read_timeout, self.stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(GatewayError::Disconnected(format!(
                "read from {} failed: {e}",
                self.settings.port
            ))),
            Err(_) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(|e| {
            GatewayError::WriteFailed(format!("write to {} failed: {e}", self.settings.port))
        })?;
        self.stream.flush().await.map_err(|e| {
            GatewayError::WriteFailed(format!("flush of {} failed: {e}", self.settings.port))
        })
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.settings.port, self.settings.baud_rate)
    }
}

/// Factory opening the configured serial device.
pub struct SerialFactory {
    settings: SerialSettings,
}

impl SerialFactory {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TransportFactory for SerialFactory {
    async fn open(&self) -> Result<Box<dyn ByteTransport>> {
        let transport = SerialTransport::open(self.settings.clone()).await?;
        Ok(Box::new(transport))
    }
}
