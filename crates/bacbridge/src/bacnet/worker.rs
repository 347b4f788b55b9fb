//! BACnet protocol loop
//!
//! Runs on a dedicated thread and owns the transport end-to-end. Callers hand
//! it frames to send through a command channel; everything that arrives is
//! demultiplexed here and routed to the correlator or the discovery windows.

use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{Datagram, Destination, Frame, Transport, TransportError};

use super::correlator::{CloseReason, Correlator, Outcome, Reply, Resolution};
use super::registry::{DeviceRegistry, Upsert};
use super::types::DeviceMetadata;

/// Commands sent from callers to the worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Put a frame on the wire
    Send { frame: Frame, dest: Destination },
    /// Stop the loop and release every pending caller
    Shutdown,
}

/// BACnet worker that runs in a blocking thread
pub struct BacnetWorker {
    transport: Box<dyn Transport>,
    cmd_rx: Receiver<WorkerCommand>,
    correlator: Arc<Correlator>,
    registry: Arc<DeviceRegistry>,
    /// How long one receive call may block before commands are checked again
    poll_interval: Duration,
}

impl BacnetWorker {
    pub fn new(
        transport: Box<dyn Transport>,
        cmd_rx: Receiver<WorkerCommand>,
        correlator: Arc<Correlator>,
        registry: Arc<DeviceRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            cmd_rx,
            correlator,
            registry,
            poll_interval,
        }
    }

    /// Run the blocking event loop until shutdown or a fatal transport error
    pub fn run(&mut self) {
        tracing::info!("BACnet worker started");

        let reason = 'run: loop {
            // Drain queued sends before blocking on the socket
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(WorkerCommand::Send { frame, dest }) => {
                        if let Err(e) = self.send(&frame, dest) {
                            if e.is_fatal() {
                                tracing::error!("BACnet transport failed while sending: {}", e);
                                break 'run CloseReason::TransportFailed(e.to_string());
                            }
                            tracing::warn!("Failed to send {} to {}: {}", frame.kind(), dest, e);
                        }
                    }
                    Ok(WorkerCommand::Shutdown) => {
                        tracing::info!("BACnet worker shutting down");
                        break 'run CloseReason::Shutdown;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::info!("Command channel disconnected, shutting down");
                        break 'run CloseReason::Shutdown;
                    }
                }
            }

            match self.transport.receive(self.poll_interval) {
                Ok(Some(datagram)) => self.handle_incoming(datagram),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("BACnet transport failed: {}", e);
                    break 'run CloseReason::TransportFailed(e.to_string());
                }
                Err(TransportError::MalformedReply {
                    peer,
                    invoke_id,
                    reason,
                }) => {
                    tracing::warn!(
                        "Malformed reply from {} (invoke_id={}): {}",
                        peer,
                        invoke_id,
                        reason
                    );
                    self.route_reply(invoke_id, peer, Outcome::Malformed(reason));
                }
                Err(e) => {
                    tracing::warn!("Dropping inbound datagram: {}", e);
                }
            }
        };

        self.correlator.close(reason);
        tracing::info!("BACnet worker stopped");
    }

    fn send(&mut self, frame: &Frame, dest: Destination) -> Result<(), TransportError> {
        self.transport.send(frame, dest)?;
        match frame.invoke_id() {
            Some(invoke_id) => {
                tracing::debug!("Sent {} to {} (invoke_id={})", frame.kind(), dest, invoke_id)
            }
            None => tracing::debug!("Sent {} to {}", frame.kind(), dest),
        }
        Ok(())
    }

    /// Route one inbound frame
    fn handle_incoming(&mut self, datagram: Datagram) {
        let Datagram { frame, source } = datagram;

        let (invoke_id, outcome) = match frame {
            Frame::IAm {
                device_id,
                max_apdu,
                segmentation,
                vendor_id,
                vendor_name,
                model_name,
            } => {
                let metadata = DeviceMetadata {
                    max_apdu,
                    segmentation,
                    vendor_id,
                    vendor_name,
                    model_name,
                };
                self.handle_iam(device_id, source, metadata);
                return;
            }
            Frame::ReadPropertyAck {
                invoke_id,
                object,
                property,
                value,
            } => (
                invoke_id,
                Outcome::Resolved(Reply::Property {
                    object,
                    property,
                    value,
                }),
            ),
            Frame::SimpleAck { invoke_id } => (invoke_id, Outcome::Resolved(Reply::Ack)),
            Frame::Error { invoke_id, reason }
            | Frame::Reject { invoke_id, reason }
            | Frame::Abort { invoke_id, reason } => (invoke_id, Outcome::Rejected(reason)),
            // Requests from other clients, including the echo of our own broadcasts
            other => {
                tracing::trace!("Ignoring {} from {}", other.kind(), source);
                return;
            }
        };

        self.route_reply(invoke_id, source, outcome);
    }

    fn route_reply(&self, invoke_id: u8, source: SocketAddr, outcome: Outcome) {
        match self.correlator.resolve(invoke_id, source, outcome) {
            Resolution::Delivered(kind) => {
                tracing::debug!("Resolved {:?} invoke_id={} from {}", kind, invoke_id, source);
            }
            Resolution::Late => {
                tracing::debug!("Discarding late reply from {} (invoke_id={})", source, invoke_id);
            }
            Resolution::WrongSource { expected } => {
                tracing::warn!(
                    "Reply for invoke_id={} came from {}, expected {}; dropped",
                    invoke_id,
                    source,
                    expected
                );
            }
            Resolution::Unknown => {
                tracing::debug!("Received reply for unknown invoke_id: {} from {}", invoke_id, source);
            }
        }
    }

    /// Registry first, then discovery windows, so a finished discovery never
    /// reports a device the registry does not know
    fn handle_iam(&mut self, device_id: u32, source: SocketAddr, metadata: DeviceMetadata) {
        let vendor_id = metadata.vendor_id;
        match self.registry.upsert(device_id, source, metadata) {
            Upsert::Inserted => {
                tracing::info!(
                    "Discovered device {} at {} (vendor={})",
                    device_id,
                    source,
                    vendor_id
                );
            }
            Upsert::Updated | Upsert::Readdressed { .. } => {
                tracing::trace!("Refreshed device {} at {}", device_id, source);
            }
        }

        if let Some(device) = self.registry.lookup(device_id) {
            self.correlator.record_iam(&device);
        }
    }
}
