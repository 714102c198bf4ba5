//! # GM3 Gateway Service (gm3srv)
//!
//! Local gateway bridging an HTTP control plane to a GM3 heat-pump
//! controller bus (token-arbitrated multi-master RS-485).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   HTTP (axum)   │───►│ Gateway Control │───►│   Serial Task   │
//! │  REST handlers  │    │  (queue + snap) │    │ (bus arbiter,   │
//! └─────────────────┘    └─────────────────┘    │  engines, port) │
//!                                               └─────────────────┘
//! ```
//!
//! A single long-running task owns the serial port, the bus arbiter state
//! machine and catalog mutation. The HTTP layer reads catalog snapshots and
//! submits write requests through a queue.

pub mod api;
pub mod core;
pub mod utils;
