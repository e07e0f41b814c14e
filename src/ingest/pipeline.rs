use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{IngestError, Result};
use crate::events::{EventBus, LinkEvent};
use crate::serial::{FrameDecoder, Reading};
use crate::store::{Database, FieldCipher, Record};

/// Decoder, encryptor and storage wired together for one target table.
///
/// Lines are decoded one at a time in arrival order; each insert runs on its
/// own task so a slow or failing insert never holds up the next line.
pub struct IngestPipeline {
    decoder: FrameDecoder,
    table: String,
    fields_to_encrypt: BTreeSet<String>,
    cipher: Arc<FieldCipher>,
    db: Database,
    events: EventBus,
}

impl IngestPipeline {
    pub fn new(
        decoder: FrameDecoder,
        table: impl Into<String>,
        fields_to_encrypt: BTreeSet<String>,
        cipher: Arc<FieldCipher>,
        db: Database,
        events: EventBus,
    ) -> Self {
        Self {
            decoder,
            table: table.into(),
            fields_to_encrypt,
            cipher,
            db,
            events,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    /// Copy of the reading with configured fields encrypted. A field that
    /// fails to encrypt is kept in plaintext so the insert still happens.
    pub fn prepare_record(&self, reading: &Reading) -> Record {
        let mut record = reading.fields().clone();
        for field in &self.fields_to_encrypt {
            let Some(value) = record.get_mut(field) else { continue };
            if value.is_null() {
                continue;
            }
            match self.cipher.encrypt_value(value) {
                Ok(encrypted) => *value = encrypted,
                Err(e) => log::error!("Failed to encrypt field '{}', storing plaintext: {}", field, e),
            }
        }
        record
    }

    /// Encrypt and insert an already validated reading.
    pub async fn ingest(&self, reading: Reading) -> Result<i64> {
        let record = self.prepare_record(&reading);
        match self.db.insert(&self.table, &record).await {
            Ok(id) => {
                log::info!("Stored reading {} in {}", id, self.table);
                self.events.publish(LinkEvent::Inserted {
                    table: self.table.clone(),
                    id,
                    values: reading.into_fields(),
                });
                Ok(id)
            }
            Err(e) => {
                log::error!("Insert into {} failed: {}", self.table, e);
                self.events.publish(LinkEvent::InsertFailed {
                    table: self.table.clone(),
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Entry point for externally produced readings (HTTP ingress).
    pub async fn ingest_json(&self, body: Value) -> Result<i64> {
        let reading = match body {
            Value::Object(fields) => Reading::from_fields(fields),
            _ => return Err(IngestError::NotAnObject),
        };
        self.decoder.validate(&reading)?;
        self.ingest(reading).await
    }

    /// Decode and validate one serial line, then dispatch its insert.
    ///
    /// Returns the insert task, or `None` when the line produced nothing to
    /// store (blank, undecodable, or missing a required field).
    pub fn handle_line(self: &Arc<Self>, raw: &str) -> Option<JoinHandle<()>> {
        let reading = match self.decoder.decode(raw) {
            Ok(Some(reading)) => reading,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Dropping undecodable line {:?}: {}", raw, e);
                self.events.publish(LinkEvent::DecodeFailed {
                    raw: raw.to_string(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        if let Err(e) = self.decoder.validate(&reading) {
            log::warn!("Dropping reading: {}", e);
            self.events.publish(LinkEvent::ReadingDropped { reason: e.to_string() });
            return None;
        }

        let pipeline = Arc::clone(self);
        Some(tokio::spawn(async move {
            // Failure is already logged and published by ingest
            let _ = pipeline.ingest(reading).await;
        }))
    }

    /// Consume lines until every sender is gone.
    pub async fn run(self: Arc<Self>, mut lines: mpsc::Receiver<String>) {
        log::info!("Ingestion started for table {}", self.table);
        while let Some(line) = lines.recv().await {
            self.handle_line(&line);
        }
        log::info!("Line channel closed, ingestion stopped");
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("table", &self.table)
            .field("format", &self.decoder.format())
            .field("fields_to_encrypt", &self.fields_to_encrypt)
            .finish()
    }
}
