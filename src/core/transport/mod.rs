//! Byte transport abstraction and the frame-level serial link.

pub mod link;
pub mod mock;
pub mod serial;
pub mod traits;

pub use link::{FrameLink, LinkStats};
pub use traits::{ByteTransport, TransportFactory};
