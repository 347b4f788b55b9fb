//! BACnet client
//!
//! Blocking read/write/discover entry points on top of the background
//! protocol loop. Overrides are consulted before anything goes on the wire.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::BacnetConfig;
use crate::error::{Error, Result};
use crate::server::FeedPublisher;
use crate::transport::{Destination, Frame, Transport, UdpTransport};

use super::cache::ValueCache;
use super::correlator::{Correlator, Outcome, Reply, RequestKind};
use super::overrides::OverrideStore;
use super::registry::DeviceRegistry;
use super::types::{Device, PropertyKey, PropertyValue};
use super::worker::{BacnetWorker, WorkerCommand};

/// Handle to a running BACnet application
///
/// Shareable across threads; every call blocks only its own caller.
pub struct BacnetClient {
    correlator: Arc<Correlator>,
    registry: Arc<DeviceRegistry>,
    overrides: Arc<OverrideStore>,
    cache: Arc<ValueCache>,
    cmd_tx: Sender<WorkerCommand>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
    default_timeout: Duration,
}

impl BacnetClient {
    /// Bind the UDP transport described by `config` and start the loop
    ///
    /// A bind failure (address in use, permission denied) is returned as
    /// `TransportFatal` and nothing is started.
    pub fn bind(config: &BacnetConfig) -> Result<Self> {
        tracing::info!(
            "Starting BACnet client on {}:{} (broadcast: {})",
            config.interface,
            config.port,
            config.broadcast.as_deref().unwrap_or("255.255.255.255")
        );
        let transport = UdpTransport::bind(&config.interface, config.port, config.broadcast.as_deref())?;
        Self::start(transport, config)
    }

    /// Start the protocol loop on an already-open transport
    pub fn start(transport: impl Transport, config: &BacnetConfig) -> Result<Self> {
        let local_addr = transport.local_addr();
        let correlator = Arc::new(Correlator::new());
        let registry = Arc::new(DeviceRegistry::new());
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let mut worker = BacnetWorker::new(
            Box::new(transport),
            cmd_rx,
            Arc::clone(&correlator),
            Arc::clone(&registry),
            config.poll_interval(),
        );
        let handle = thread::Builder::new()
            .name("bacnet-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::TransportFatal(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            correlator,
            registry,
            overrides: Arc::new(OverrideStore::new()),
            cache: Arc::new(ValueCache::new()),
            cmd_tx,
            worker_handle: Mutex::new(Some(handle)),
            local_addr,
            default_timeout: config.default_timeout(),
        })
    }

    /// Read one property
    ///
    /// An active override is returned immediately without touching the
    /// network, whatever the timeout.
    pub fn read_property(&self, key: &PropertyKey, timeout: Duration) -> Result<PropertyValue> {
        if let Some(value) = self.overrides.current(key) {
            tracing::debug!("Read {} served from override", key);
            return Ok(value);
        }

        let address = self.target(key, timeout)?;
        let handle = self.correlator.submit(RequestKind::Read, address, timeout)?;
        self.dispatch(
            Frame::ReadProperty {
                invoke_id: handle.invoke_id(),
                object: key.object,
                property: key.property,
                array_index: None,
            },
            Destination::Unicast(address),
        )?;

        match handle.wait() {
            Outcome::Resolved(Reply::Property {
                object,
                property,
                value,
            }) => {
                if object != key.object || property != key.property {
                    return Err(Error::MalformedResponse(format!(
                        "asked for {} {}, device answered {} {}",
                        key.object, key.property, object, property
                    )));
                }
                self.cache.record(*key, value.clone());
                Ok(value)
            }
            Outcome::Resolved(Reply::Ack) => Err(Error::MalformedResponse(
                "simple ack in answer to a read".to_string(),
            )),
            other => Err(self.failure(key, timeout, other)),
        }
    }

    /// Write one property
    ///
    /// `priority` goes to the device unchanged; the device decides whether
    /// the value/priority combination is acceptable. An overridden key is
    /// updated locally instead.
    pub fn write_property(
        &self,
        key: &PropertyKey,
        value: PropertyValue,
        priority: Option<u8>,
        timeout: Duration,
    ) -> Result<()> {
        if self.overrides.update_existing(key, value.clone()) {
            tracing::debug!("Write {} applied to override", key);
            return Ok(());
        }

        let address = self.target(key, timeout)?;
        let handle = self.correlator.submit(RequestKind::Write, address, timeout)?;
        self.dispatch(
            Frame::WriteProperty {
                invoke_id: handle.invoke_id(),
                object: key.object,
                property: key.property,
                value,
                priority,
            },
            Destination::Unicast(address),
        )?;

        match handle.wait() {
            Outcome::Resolved(Reply::Ack) => Ok(()),
            Outcome::Resolved(Reply::Property { .. }) => Err(Error::MalformedResponse(
                "property data in answer to a write".to_string(),
            )),
            other => Err(self.failure(key, timeout, other)),
        }
    }

    /// Broadcast Who-Is and collect every device that answers within `timeout`
    ///
    /// An empty result is a valid outcome.
    pub fn discover(&self, timeout: Duration) -> Result<Vec<Device>> {
        self.run_discovery(None, timeout)
    }

    /// Who-Is limited to device instances `low..=high`
    pub fn discover_range(&self, low: u32, high: u32, timeout: Duration) -> Result<Vec<Device>> {
        self.run_discovery(Some((low, high)), timeout)
    }

    fn run_discovery(&self, range: Option<(u32, u32)>, timeout: Duration) -> Result<Vec<Device>> {
        let handle = self.correlator.begin_discovery(range, timeout)?;
        let session_id = handle.session_id();
        tracing::info!(
            "Starting discovery session {} ({}ms window)",
            session_id,
            timeout.as_millis()
        );

        self.dispatch(
            Frame::WhoIs {
                low_limit: range.map(|(low, _)| low),
                high_limit: range.map(|(_, high)| high),
            },
            Destination::Broadcast,
        )?;

        let devices = handle.wait()?;
        tracing::info!(
            "Discovery session {} completed ({} devices found)",
            session_id,
            devices.len()
        );
        Ok(devices)
    }

    /// Validate the deadline and resolve the device address
    fn target(&self, key: &PropertyKey, timeout: Duration) -> Result<SocketAddr> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be positive".to_string()));
        }
        self.registry
            .address_of(key.device_id)
            .ok_or(Error::UnknownDevice(key.device_id))
    }

    fn dispatch(&self, frame: Frame, dest: Destination) -> Result<()> {
        self.cmd_tx
            .send(WorkerCommand::Send { frame, dest })
            .map_err(|_| match self.correlator.closed_reason() {
                Some(reason) => reason.into(),
                None => Error::Shutdown,
            })
    }

    fn failure(&self, key: &PropertyKey, timeout: Duration, outcome: Outcome) -> Error {
        match outcome {
            Outcome::TimedOut => {
                tracing::warn!("No response for {} after {}ms", key, timeout.as_millis());
                Error::NoResponse {
                    device_id: key.device_id,
                    timeout,
                }
            }
            Outcome::Rejected(reason) => {
                tracing::warn!("Device rejected {}: {}", key, reason);
                Error::Rejected(reason)
            }
            Outcome::Malformed(reason) => {
                tracing::warn!("Undecodable reply for {}: {}", key, reason);
                Error::MalformedResponse(reason)
            }
            Outcome::Closed(reason) => reason.into(),
            Outcome::Resolved(reply) => {
                Error::MalformedResponse(format!("unexpected reply {:?}", reply))
            }
        }
    }

    /// Simulate a value locally
    pub fn set_override(&self, key: PropertyKey, value: PropertyValue) {
        self.overrides.set(key, value);
    }

    /// Stop simulating; the next read goes to the device again
    pub fn clear_override(&self, key: &PropertyKey) -> Option<PropertyValue> {
        self.overrides.clear(key)
    }

    pub fn is_overridden(&self, key: &PropertyKey) -> bool {
        self.overrides.is_overridden(key)
    }

    pub fn current_override(&self, key: &PropertyKey) -> Option<PropertyValue> {
        self.overrides.current(key)
    }

    /// Snapshot of every device discovered so far
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Pull interface for renderers
    pub fn feed(&self) -> FeedPublisher {
        FeedPublisher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.overrides),
            Arc::clone(&self.cache),
        )
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// False once shut down or after the transport died
    pub fn is_running(&self) -> bool {
        self.correlator.closed_reason().is_none()
    }

    /// Stop the protocol loop; pending calls return `Shutdown`
    pub fn shutdown(&self) {
        let Some(handle) = self.worker_handle.lock().take() else {
            return;
        };
        tracing::info!("Stopping BACnet client");

        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
        if handle.join().is_err() {
            tracing::error!("BACnet worker panicked");
        }
        // Covers a worker that died without closing
        self.correlator.close(super::correlator::CloseReason::Shutdown);

        tracing::info!("BACnet client stopped");
    }
}

impl Drop for BacnetClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BacnetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacnetClient")
            .field("local_addr", &self.local_addr)
            .field("devices", &self.registry.len())
            .field("pending", &self.correlator.pending_count())
            .field("running", &self.is_running())
            .finish()
    }
}
