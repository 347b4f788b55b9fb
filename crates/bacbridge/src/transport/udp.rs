//! BACnet/IP-style UDP adapter
//!
//! Frames travel as one JSON document per datagram.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use super::{decode_frame, Datagram, Destination, Frame, Transport, TransportError};

/// Standard BACnet/IP port (0xBAC0)
pub const BACNET_PORT: u16 = 47808;

/// Largest UDP payload over IPv4; anything shorter would truncate silently
const MAX_DATAGRAM: usize = 65507;

/// UDP transport bound to a local interface
pub struct UdpTransport {
    socket: UdpSocket,
    broadcast: SocketAddr,
    buffer: Vec<u8>,
}

impl UdpTransport {
    /// Bind to `interface:port` with broadcast enabled
    ///
    /// `broadcast` is an IP (port 47808 is implied) or a full `ip:port`.
    /// Defaults to the limited broadcast address.
    pub fn bind(interface: &str, port: u16, broadcast: Option<&str>) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", interface, port);
        let socket = UdpSocket::bind(&addr).map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
        socket
            .set_broadcast(true)
            .map_err(|source| TransportError::Bind { addr, source })?;

        let broadcast = parse_broadcast(broadcast.unwrap_or("255.255.255.255"))?;
        tracing::info!(
            "BACnet transport bound to {} (broadcast {})",
            socket.local_addr()?,
            broadcast
        );

        Ok(Self {
            socket,
            broadcast,
            buffer: vec![0u8; MAX_DATAGRAM],
        })
    }
}

/// Broadcasts go to the standard port unless one is given explicitly
fn parse_broadcast(addr: &str) -> Result<SocketAddr, TransportError> {
    let with_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, BACNET_PORT)
    };
    with_port
        .parse()
        .map_err(|e| TransportError::InvalidAddress(format!("Invalid broadcast address {}: {}", addr, e)))
}

impl Transport for UdpTransport {
    fn send(&mut self, frame: &Frame, dest: Destination) -> Result<(), TransportError> {
        let target = match dest {
            Destination::Unicast(addr) => addr,
            Destination::Broadcast => self.broadcast,
        };
        let bytes = serde_json::to_vec(frame).map_err(|e| {
            TransportError::Io(std::io::Error::new(ErrorKind::InvalidData, e))
        })?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} frame is {} bytes, over the datagram limit", frame.kind(), bytes.len()),
            )));
        }
        self.socket.send_to(&bytes, target)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        // A zero read timeout means "block forever" to the OS
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let (len, source) = match self.socket.recv_from(&mut self.buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let frame = decode_frame(&self.buffer[..len], source)?;

        Ok(Some(Datagram { frame, source }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
