//! GM3 wire protocol: framing, CRC, typed values and payload codecs.

pub mod constants;
pub mod crc;
pub mod frame;
pub mod pdu;
pub mod value;

pub use constants::{Command, ServiceFunction};
pub use frame::{Frame, FrameError};
pub use value::{ParamType, ParamValue};
