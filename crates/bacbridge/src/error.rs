//! Error types

use std::time::Duration;

use crate::transport::TransportError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by reads, writes and discovery
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed request parameters, detected before any network activity
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device never answered within the deadline
    #[error("No response from device {device_id} after {}ms", timeout.as_millis())]
    NoResponse { device_id: u32, timeout: Duration },

    /// The device answered with an explicit protocol error
    #[error("Rejected: {0}")]
    Rejected(String),

    /// A reply arrived but did not make sense for the request
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The transport failed to start or died
    #[error("Transport failure: {0}")]
    TransportFatal(String),

    #[error("Device {0} not found in registry. Run discovery first.")]
    UnknownDevice(u32),

    #[error("Client is shut down")]
    Shutdown,

    #[error("No free invoke id, too many outstanding requests")]
    Busy,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::TransportFatal(e.to_string())
    }
}
