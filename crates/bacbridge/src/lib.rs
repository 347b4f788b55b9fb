//! bacbridge - BACnet/IP client
//!
//! This crate provides:
//! - Device discovery (Who-Is/I-Am) and a device registry
//! - Concurrent ReadProperty/WriteProperty with per-request deadlines
//! - Local overrides for simulating point values
//! - A read-only HTTP feed for trend renderers

// BACnet client and protocol loop
pub mod bacnet;

// Configuration
pub mod config;

// Error types
pub mod error;

// Trend feed
pub mod server;

// Datagram transports
pub mod transport;

pub use bacnet::BacnetClient;
pub use config::BacnetConfig;
pub use error::{Error, Result};
