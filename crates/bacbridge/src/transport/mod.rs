//! Datagram transport
//!
//! The protocol loop only needs "kind + correlation key + payload + source
//! address" from the wire. Adapters own the encoding and the socket.

mod memory;
mod udp;

pub use memory::{Injector, MemoryPeer, MemoryTransport};
pub use udp::UdpTransport;

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bacnet::types::{ObjectId, PropertyIdentifier, PropertyValue, Segmentation};

/// A protocol message, already decoded by the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Frame {
    /// Who-Is broadcast, optionally bounded to a device range
    WhoIs {
        low_limit: Option<u32>,
        high_limit: Option<u32>,
    },
    IAm {
        device_id: u32,
        max_apdu: u16,
        segmentation: Segmentation,
        vendor_id: u16,
        #[serde(default)]
        vendor_name: Option<String>,
        #[serde(default)]
        model_name: Option<String>,
    },
    ReadProperty {
        invoke_id: u8,
        object: ObjectId,
        property: PropertyIdentifier,
        #[serde(default)]
        array_index: Option<u32>,
    },
    ReadPropertyAck {
        invoke_id: u8,
        object: ObjectId,
        property: PropertyIdentifier,
        value: PropertyValue,
    },
    WriteProperty {
        invoke_id: u8,
        object: ObjectId,
        property: PropertyIdentifier,
        value: PropertyValue,
        #[serde(default)]
        priority: Option<u8>,
    },
    SimpleAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        reason: String,
    },
    Reject {
        invoke_id: u8,
        reason: String,
    },
    Abort {
        invoke_id: u8,
        reason: String,
    },
}

impl Frame {
    /// Correlation key, if this frame answers a confirmed request
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Frame::WhoIs { .. } | Frame::IAm { .. } => None,
            Frame::ReadProperty { invoke_id, .. }
            | Frame::ReadPropertyAck { invoke_id, .. }
            | Frame::WriteProperty { invoke_id, .. }
            | Frame::SimpleAck { invoke_id }
            | Frame::Error { invoke_id, .. }
            | Frame::Reject { invoke_id, .. }
            | Frame::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::WhoIs { .. } => "who-is",
            Frame::IAm { .. } => "i-am",
            Frame::ReadProperty { .. } => "read-property",
            Frame::ReadPropertyAck { .. } => "read-property-ack",
            Frame::WriteProperty { .. } => "write-property",
            Frame::SimpleAck { .. } => "simple-ack",
            Frame::Error { .. } => "error",
            Frame::Reject { .. } => "reject",
            Frame::Abort { .. } => "abort",
        }
    }
}

/// Where a frame is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    Broadcast,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Unicast(addr) => write!(f, "{}", addr),
            Destination::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// An inbound frame and who sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub frame: Frame,
    pub source: SocketAddr,
}

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Undecodable frame from {peer}: {reason}")]
    Decode { peer: SocketAddr, reason: String },

    /// A reply whose correlation fields decoded but whose payload did not
    #[error("Malformed reply from {peer} (invoke_id={invoke_id}): {reason}")]
    MalformedReply {
        peer: SocketAddr,
        invoke_id: u8,
        reason: String,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the protocol loop can keep running after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Bind { .. } | TransportError::Closed)
    }
}

/// Correlation fields of a frame, readable even when the payload is not
#[derive(Deserialize)]
struct Envelope {
    kind: String,
    invoke_id: Option<u8>,
}

/// Frame kinds that answer a confirmed request
const REPLY_KINDS: [&str; 5] = ["read-property-ack", "simple-ack", "error", "reject", "abort"];

/// Decode one JSON frame received from `peer`
///
/// Decoding happens in two stages. When the whole frame fails but the
/// envelope names a reply kind and an invoke id, the error is
/// `MalformedReply` so the waiting transaction can be failed right away.
pub fn decode_frame(bytes: &[u8], peer: SocketAddr) -> Result<Frame, TransportError> {
    let err = match serde_json::from_slice::<Frame>(bytes) {
        Ok(frame) => return Ok(frame),
        Err(e) => e,
    };

    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(Envelope {
            kind,
            invoke_id: Some(invoke_id),
        }) if REPLY_KINDS.contains(&kind.as_str()) => Err(TransportError::MalformedReply {
            peer,
            invoke_id,
            reason: err.to_string(),
        }),
        _ => Err(TransportError::Decode {
            peer,
            reason: err.to_string(),
        }),
    }
}

/// Datagram transport owned by the protocol loop
pub trait Transport: Send + 'static {
    /// Send one frame
    fn send(&mut self, frame: &Frame, dest: Destination) -> Result<(), TransportError>;

    /// Wait up to `timeout` for one inbound frame
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError>;

    /// Bound address, if the adapter has one
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::ObjectType;

    #[test]
    fn test_invoke_id() {
        let frame = Frame::SimpleAck { invoke_id: 9 };
        assert_eq!(frame.invoke_id(), Some(9));
        let frame = Frame::WhoIs { low_limit: None, high_limit: None };
        assert_eq!(frame.invoke_id(), None);
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::ReadProperty {
            invoke_id: 4,
            object: ObjectId::new(ObjectType::AnalogInput, 1),
            property: PropertyIdentifier::PresentValue,
            array_index: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "read-property");
        assert_eq!(json["object"]["object_type"], "analog-input");
        assert_eq!(json["property"], "present-value");
    }

    #[test]
    fn test_decode_reply_with_bad_payload() {
        let peer: SocketAddr = "10.0.0.9:47808".parse().unwrap();
        let bytes = br#"{"kind":"read-property-ack","invoke_id":17,
            "object":{"object_type":"analog-input","instance":1},
            "property":"present-value","value":{"type":"real","value":"garbage"}}"#;

        let err = decode_frame(bytes, peer).unwrap_err();
        match err {
            TransportError::MalformedReply { invoke_id, peer: from, .. } => {
                assert_eq!(invoke_id, 17);
                assert_eq!(from, peer);
            }
            other => panic!("expected a malformed reply, got {:?}", other),
        }
        assert!(!TransportError::MalformedReply { peer, invoke_id: 17, reason: String::new() }.is_fatal());
    }

    #[test]
    fn test_decode_without_correlation_is_plain_decode_error() {
        let peer: SocketAddr = "10.0.0.9:47808".parse().unwrap();
        // Requests and unconfirmed frames carry nothing to fail
        let bad_request = br#"{"kind":"read-property","invoke_id":3,"object":7}"#;
        let bad_iam = br#"{"kind":"i-am","device_id":"x"}"#;
        for bytes in [&bad_request[..], &bad_iam[..], &b"not json"[..]] {
            assert!(matches!(decode_frame(bytes, peer), Err(TransportError::Decode { .. })));
        }
        assert_eq!(
            decode_frame(br#"{"kind":"simple-ack","invoke_id":2}"#, peer).unwrap(),
            Frame::SimpleAck { invoke_id: 2 }
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::Closed.is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(!TransportError::Io(io).is_fatal());
    }
}
