//! In-process transport
//!
//! `MemoryTransport` goes to the protocol loop; the matching `MemoryPeer`
//! stands in for the network: it sees every outbound frame, can inject
//! inbound ones (decoded or raw bytes) and can make the adapter fail.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{decode_frame, Datagram, Destination, Frame, Transport, TransportError};

type Inbound = Result<Datagram, TransportError>;

/// Channel-backed transport
pub struct MemoryTransport {
    local: SocketAddr,
    inbound_rx: Receiver<Inbound>,
    outbound_tx: Sender<(Frame, Destination)>,
    send_failures: Arc<Mutex<VecDeque<TransportError>>>,
    sent: Arc<AtomicUsize>,
}

/// The network side of a `MemoryTransport`
pub struct MemoryPeer {
    inbound_tx: Sender<Inbound>,
    outbound_rx: Receiver<(Frame, Destination)>,
    send_failures: Arc<Mutex<VecDeque<TransportError>>>,
    sent: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair
    pub fn pair(local: SocketAddr) -> (MemoryTransport, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let send_failures = Arc::new(Mutex::new(VecDeque::new()));
        let sent = Arc::new(AtomicUsize::new(0));

        let transport = MemoryTransport {
            local,
            inbound_rx,
            outbound_tx,
            send_failures: Arc::clone(&send_failures),
            sent: Arc::clone(&sent),
        };
        let peer = MemoryPeer {
            inbound_tx,
            outbound_rx,
            send_failures,
            sent,
        };
        (transport, peer)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &Frame, dest: Destination) -> Result<(), TransportError> {
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        // A peer that stopped listening is a lossy network, not a dead transport
        let _ = self.outbound_tx.send((frame.clone(), dest));
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(inbound) => inbound.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl MemoryPeer {
    /// Deliver a frame to the transport as if `source` sent it
    pub fn inject(&self, frame: Frame, source: SocketAddr) {
        let _ = self.inbound_tx.send(Ok(Datagram { frame, source }));
    }

    /// Deliver raw bytes, decoded the way the UDP adapter decodes them
    pub fn inject_raw(&self, bytes: &[u8], source: SocketAddr) {
        let inbound = decode_frame(bytes, source).map(|frame| Datagram { frame, source });
        let _ = self.inbound_tx.send(inbound);
    }

    /// Make the next receive fail with `err`
    pub fn inject_error(&self, err: TransportError) {
        let _ = self.inbound_tx.send(Err(err));
    }

    /// Make the next send fail with `err`; queued failures apply in order
    pub fn fail_next_send(&self, err: TransportError) {
        self.send_failures.lock().push_back(err);
    }

    /// Wait for the next frame the transport sent
    pub fn next_sent(&self, timeout: Duration) -> Option<(Frame, Destination)> {
        self.outbound_rx.recv_timeout(timeout).ok()
    }

    /// Number of frames the transport has sent so far
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// A second handle that can only inject frames
    pub fn injector(&self) -> Injector {
        Injector {
            inbound_tx: self.inbound_tx.clone(),
        }
    }
}

/// Cloneable inject-only handle, for replies from several threads
#[derive(Clone)]
pub struct Injector {
    inbound_tx: Sender<Inbound>,
}

impl Injector {
    pub fn inject(&self, frame: Frame, source: SocketAddr) {
        let _ = self.inbound_tx.send(Ok(Datagram { frame, source }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pair_delivers_both_ways() {
        let (mut transport, peer) = MemoryTransport::pair(addr("10.0.0.1:47808"));

        transport
            .send(&Frame::WhoIs { low_limit: None, high_limit: None }, Destination::Broadcast)
            .unwrap();
        let (frame, dest) = peer.next_sent(Duration::from_millis(100)).unwrap();
        assert_eq!(frame.kind(), "who-is");
        assert_eq!(dest, Destination::Broadcast);
        assert_eq!(peer.sent_count(), 1);

        peer.inject(Frame::SimpleAck { invoke_id: 1 }, addr("10.0.0.7:47808"));
        let datagram = transport.receive(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(datagram.source, addr("10.0.0.7:47808"));
    }

    #[test]
    fn test_injected_failures() {
        let (mut transport, peer) = MemoryTransport::pair(addr("10.0.0.1:47808"));
        let source = addr("10.0.0.7:47808");

        peer.inject_raw(b"\x81\x0b", source);
        assert!(matches!(
            transport.receive(Duration::from_millis(100)),
            Err(TransportError::Decode { .. })
        ));
        peer.inject_error(TransportError::Io(std::io::Error::other("reset")));
        assert!(matches!(
            transport.receive(Duration::from_millis(100)),
            Err(TransportError::Io(_))
        ));
        peer.inject_raw(br#"{"kind":"simple-ack","invoke_id":4}"#, source);
        let datagram = transport.receive(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(datagram.frame, Frame::SimpleAck { invoke_id: 4 });

        peer.fail_next_send(TransportError::Io(std::io::Error::other("no route")));
        let frame = Frame::SimpleAck { invoke_id: 1 };
        assert!(transport.send(&frame, Destination::Broadcast).is_err());
        transport.send(&frame, Destination::Broadcast).unwrap();
        assert_eq!(peer.sent_count(), 1);
    }

    #[test]
    fn test_dropped_peer_closes_transport() {
        let (mut transport, peer) = MemoryTransport::pair(addr("10.0.0.1:47808"));
        assert!(transport.receive(Duration::from_millis(5)).unwrap().is_none());
        drop(peer);
        assert!(matches!(
            transport.receive(Duration::from_millis(5)),
            Err(TransportError::Closed)
        ));
    }
}
