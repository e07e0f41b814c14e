pub mod decoder;
pub mod discovery;
pub mod endpoint;
pub mod interface;

pub use decoder::{DecodeError, FrameDecoder, Reading, ValidationError};
pub use discovery::{list_candidate_ports, score_port, select_best_port};
pub use endpoint::{SerialEndpoint, WireFormat};
pub use interface::{LinkIo, SerialBackend, SystemSerial};

use serde::{Deserialize, Serialize};

/// One enumerated serial port, with whatever USB metadata the OS reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortInfo {
    /// A port with no USB metadata (PCI, Bluetooth, virtual ...).
    pub fn bare(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("No serial ports available")]
    NoPortsAvailable,

    #[error("Port enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Failures to find a port at all, as opposed to failing to open one.
    /// These are not retried until the next explicit connect.
    pub fn is_discovery_failure(&self) -> bool {
        matches!(self, Self::NoPortsAvailable | Self::EnumerationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
