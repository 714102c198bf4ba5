//! Transport abstraction separating byte I/O from frame logic.

use std::time::Duration;

use async_trait::async_trait;

use crate::utils::error::Result;

/// A half-duplex byte pipe. The serial implementation is the production
/// transport; a scripted mock stands in for it in tests.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Read whatever bytes are available, blocking up to `timeout`.
    ///
    /// Returns `Ok(0)` when the timeout elapsed without data. Errors mean
    /// the transport is unusable and must be reopened.
    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write the full buffer.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Human-readable identity for logs ("/dev/econext @ 115200").
    fn describe(&self) -> String;
}

/// Opens transports. The serial task goes through a factory so reconnection
/// and tests (mock bus) share one code path.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ByteTransport>>;
}
