//! Explicitly constructed application context shared by every consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, ConfigError};
use crate::device::DeviceManager;
use crate::events::EventBus;
use crate::ingest::IngestPipeline;
use crate::serial::{FrameDecoder, SerialBackend};
use crate::store::{Database, FieldCipher, StoreError};

/// Lines buffered between the serial reader and the pipeline.
pub const LINE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ContextError>;

pub struct AppContext {
    config: AppConfig,
    events: EventBus,
    db: Database,
    device: DeviceManager,
    pipeline: Arc<IngestPipeline>,
    lines_rx: Mutex<Option<mpsc::Receiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AppContext {
    /// Wire every component from configuration. Nothing is started yet.
    pub async fn build(config: AppConfig, backend: Arc<dyn SerialBackend>) -> Result<Arc<Self>> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        let events = EventBus::default();
        let cipher = Arc::new(FieldCipher::from_secret(config.secret()));
        let db = Database::open(&config.storage.path, Arc::clone(&cipher), config.decrypt_policy())?;
        if let Some(schema) = &config.storage.schema_file {
            db.apply_schema_file(schema).await?;
        }

        let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let device = DeviceManager::new(
            endpoint.clone(),
            backend,
            config.reconnect_policy(),
            events.clone(),
            lines_tx,
            config.serial.dynamic_port_switching,
        );
        let pipeline = Arc::new(IngestPipeline::new(
            FrameDecoder::new(&endpoint),
            config.storage.table.clone(),
            endpoint.fields_to_encrypt.clone(),
            cipher,
            db.clone(),
            events.clone(),
        ));

        log::info!(
            "SensorLink context ready: {} format, table {}",
            endpoint.format,
            config.storage.table
        );

        Ok(Arc::new(Self {
            config,
            events,
            db,
            device,
            pipeline,
            lines_rx: Mutex::new(Some(lines_rx)),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn device(&self) -> &DeviceManager {
        &self.device
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Spawn the ingestion task and, if configured, the first connect.
    /// Later calls do nothing.
    pub fn start(&self) {
        let Some(lines_rx) = lock(&self.lines_rx).take() else {
            log::debug!("Context already started");
            return;
        };

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(Arc::clone(&self.pipeline).run(lines_rx)));

        if self.config.serial.auto_connect {
            let device = self.device.clone();
            let delay = self.config.startup_delay();
            tasks.push(tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = device.connect().await {
                    log::warn!("Initial serial connection failed: {}", e);
                }
            }));
        }
    }

    /// Close the serial link without reconnecting, then close storage.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down");

        // Stop the startup connect before closing so it cannot reopen the link
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Err(e) = self.device.disconnect().await {
            log::warn!("Error closing serial link: {}", e);
        }
        self.db.close();
        log::info!("Shutdown complete");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
