//! Error handling for the GM3 gateway service.
//!
//! One service-wide error enum covering the transport, framing, protocol,
//! arbitration and semantic layers. Transport and framing errors are
//! recovered locally (reconnect/resync); protocol and arbitration errors end
//! a batch but never the process; semantic errors are surfaced verbatim to
//! the HTTP layer.

use thiserror::Error;

use crate::core::protocol::frame::FrameError;

/// GM3 Gateway Error Type
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Serial device could not be opened
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    /// Serial connection was lost mid-operation
    #[error("serial connection lost: {0}")]
    Disconnected(String),

    /// Write to the serial device failed
    #[error("serial write failed: {0}")]
    WriteFailed(String),

    /// Frame-level parse or validation error
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Controller answered NO_DATA (0x7F)
    #[error("controller reported no data")]
    NoData,

    /// Controller answered DATA_SIZE_ERROR (0x7E), or a response payload
    /// was truncated relative to its declared content
    #[error("data size error: {0}")]
    DataSizeError(String),

    /// A reply carried a command code we did not expect
    #[error("unexpected command 0x{0:02X}")]
    UnexpectedCommand(u8),

    /// A value batch referenced a wire index the catalog does not know
    #[error("catalog drift: unknown wire index {0}")]
    CatalogDrift(u16),

    /// No token grant arrived within the caller's deadline
    #[error("timed out waiting for bus token")]
    TokenTimeout,

    /// Address auto-claim could not complete
    #[error("address claim failed: {0}")]
    ClaimFailed(String),

    /// Selector did not resolve to a catalog entry
    #[error("parameter not found: {0}")]
    ParameterNotFound(String),

    /// Write attempt against a read-only parameter
    #[error("parameter is read-only: {0}")]
    NotWritable(String),

    /// Proposed value cannot be coerced to the parameter's wire type
    #[error("bad value type: {0}")]
    BadValueType(String),

    /// Proposed value violates the parameter's min/max bounds
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Controller acknowledged MODIFY_PARAM with a non-zero result code
    #[error("write rejected by controller (code 0x{0:02X})")]
    WriteRejected(u8),

    /// No MODIFY_PARAM acknowledgement within the attempt budget
    #[error("write not acknowledged by controller")]
    WriteTimeout,

    /// Request was cancelled before completion
    #[error("request cancelled")]
    Cancelled,

    /// Configuration loading or validation errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Input/output errors outside the serial path
    #[error("io error: {0}")]
    Io(String),

    /// General internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("JSON error: {err}"))
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl GatewayError {
    /// Whether the error indicates a lost or unusable transport, requiring
    /// a close-and-reopen cycle.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::PortUnavailable(_)
                | GatewayError::Disconnected(_)
                | GatewayError::WriteFailed(_)
        )
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}
