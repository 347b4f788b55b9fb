//! BACnet Client
//!
//! Device discovery and property read/write over BACnet/IP.
//!
//! A blocking worker thread owns the transport; callers block on their own
//! transaction only, so any number of requests can be in flight at once.

pub mod cache;
mod client;
mod correlator;
pub mod overrides;
pub mod registry;
pub mod types;
mod worker;

pub use client::BacnetClient;
pub use correlator::{CloseReason, Correlator, DiscoveryHandle, Outcome, Reply, RequestKind, Resolution, TransactionHandle};
pub use types::{Device, DeviceMetadata, ObjectId, ObjectType, PropertyIdentifier, PropertyKey, PropertyValue, Segmentation};
pub use worker::{BacnetWorker, WorkerCommand};
