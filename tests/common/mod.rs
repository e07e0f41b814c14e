#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use sensorlink_lib::config::AppConfig;
use sensorlink_lib::context::AppContext;
use sensorlink_lib::serial::{self, LinkIo, PortInfo, SerialBackend, SerialError};

/// In-memory serial backend. Every successful open hands the device end of a
/// duplex pipe to the test through `links`.
pub struct MockSerial {
    ports: Mutex<Vec<PortInfo>>,
    failing: AtomicBool,
    enumeration_failing: AtomicBool,
    open_calls: AtomicUsize,
    list_calls: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    links_tx: mpsc::UnboundedSender<(String, DuplexStream)>,
}

impl MockSerial {
    pub fn new(ports: Vec<PortInfo>) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let mock = Arc::new(Self {
            ports: Mutex::new(ports),
            failing: AtomicBool::new(false),
            enumeration_failing: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            open_delay: Mutex::new(None),
            links_tx,
        });
        (mock, links_rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_enumeration_failing(&self, failing: bool) {
        self.enumeration_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn add_port(&self, port: PortInfo) {
        self.ports.lock().unwrap().push(port);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SerialBackend for MockSerial {
    fn list_ports(&self) -> serial::Result<Vec<PortInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.enumeration_failing.load(Ordering::SeqCst) {
            return Err(SerialError::EnumerationFailed("udev unavailable".to_string()));
        }
        Ok(self.ports.lock().unwrap().clone())
    }

    async fn open(&self, path: &str, _baud_rate: u32) -> serial::Result<Box<dyn LinkIo>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SerialError::OpenFailed {
                port: path.to_string(),
                reason: "device unplugged".to_string(),
            });
        }
        let (host, device) = tokio::io::duplex(4096);
        let _ = self.links_tx.send((path.to_string(), device));
        Ok(Box::new(host))
    }
}

pub fn arduino(name: &str) -> PortInfo {
    PortInfo {
        port_name: name.to_string(),
        vid: Some(0x2341),
        pid: Some(0x0043),
        serial_number: None,
        manufacturer: Some("Arduino LLC".to_string()),
        product: None,
    }
}

pub const READINGS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    device_id TEXT,
    temperature_reading TEXT,
    humidity REAL
);
";

/// In-memory storage, no HTTP, no auto-connect.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.path = ":memory:".into();
    config.api.enabled = false;
    config.serial.auto_connect = false;
    config.serial.path = Some("/dev/ttyMOCK0".into());
    config.serial.line_delimiter = "\\n".into();
    config.security.secret = Some("test-secret".into());
    config
}

pub async fn test_context(config: AppConfig, backend: Arc<MockSerial>) -> Arc<AppContext> {
    let ctx = AppContext::build(config, backend).await.unwrap();
    ctx.db().execute_batch(READINGS_SCHEMA).await.unwrap();
    ctx
}
