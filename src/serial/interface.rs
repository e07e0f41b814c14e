use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

use super::{PortInfo, Result, SerialError};

/// Byte stream of an open serial link.
///
/// Anything readable and writable qualifies, so tests can drive the device
/// manager through an in-memory duplex pipe instead of real hardware.
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// OS-facing side of the serial link: enumeration and opening.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Enumerate serial ports in OS order
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a port for async reading and writing
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn LinkIo>>;
}

/// Backend over the real serial ports of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SystemSerial {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| SerialError::EnumerationFailed(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => PortInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => PortInfo::bare(port.port_name),
            })
            .collect())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn LinkIo>> {
        log::info!("Opening serial port {} @ {} baud", path, baud_rate);
        let stream = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::OpenFailed {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}
