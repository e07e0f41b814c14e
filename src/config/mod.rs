//! Application configuration: TOML file, then environment overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::ReconnectPolicy;
use crate::serial::{SerialEndpoint, WireFormat};
use crate::store::DecryptPolicy;

pub const ENV_SECRET: &str = "SENSORLINK_SECRET";
pub const ENV_SECRET_LEGACY: &str = "DB_ENCRYPTION_KEY";
pub const ENV_DB_PATH: &str = "SENSORLINK_DB_PATH";
pub const ENV_API_PORT: &str = "SENSORLINK_API_PORT";
pub const ENV_SERIAL_PORT: &str = "SENSORLINK_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unsupported wire format: {0}")]
    UnsupportedFormat(String),

    #[error("Format {0} needs a non-empty field_mapping")]
    MissingFieldMapping(WireFormat),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("A cipher secret is required when fields are encrypted (set SENSORLINK_SECRET)")]
    MissingSecret,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Fixed port path; empty or absent means auto-detect
    pub path: Option<String>,
    pub baud_rate: u32,
    /// Accepts `\r`, `\n` and `\t` escapes
    pub line_delimiter: String,
    pub csv_delimiter: String,
    /// json-object, json-array, csv or raw
    pub format: String,
    pub field_mapping: Vec<String>,
    pub required_fields: Vec<String>,
    pub fields_to_encrypt: Vec<String>,
    pub reconnect_delay_ms: u64,
    pub max_retries: u32,
    pub dynamic_port_switching: bool,
    pub auto_connect: bool,
    pub startup_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: 9600,
            line_delimiter: "\\r\\n".into(),
            csv_delimiter: ",".into(),
            format: "json-object".into(),
            field_mapping: Vec::new(),
            required_fields: Vec::new(),
            fields_to_encrypt: Vec::new(),
            reconnect_delay_ms: 3000,
            max_retries: 5,
            dynamic_port_switching: false,
            auto_connect: true,
            startup_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file, or `:memory:`
    pub path: String,
    /// SQL run once at open, e.g. `CREATE TABLE IF NOT EXISTS ...`
    pub schema_file: Option<PathBuf>,
    /// Table that ingested readings go to
    pub table: String,
    /// Extra encrypted columns per table, for data written by other producers
    pub encrypted_columns: BTreeMap<String, Vec<String>>,
    /// Probe every column of every row for encrypted values
    pub legacy_decrypt_probe: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "sensorlink.db".into(),
            schema_file: None,
            table: "sensor_readings".into(),
            encrypted_columns: BTreeMap::new(),
            legacy_decrypt_probe: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
}

impl AppConfig {
    /// Load from an optional TOML file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SECRET).or_else(|| lookup(ENV_SECRET_LEGACY)) {
            self.security.secret = Some(secret);
        }
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.storage.path = path;
        }
        if let Some(port) = lookup(ENV_API_PORT) {
            self.api.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: ENV_API_PORT.into(),
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(path) = lookup(ENV_SERIAL_PORT) {
            self.serial.path = Some(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let format = self.wire_format()?;
        if format.needs_mapping() && self.serial.field_mapping.is_empty() {
            return Err(ConfigError::MissingFieldMapping(format));
        }
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "must be greater than zero"));
        }
        if unescape(&self.serial.line_delimiter).is_empty() {
            return Err(invalid("serial.line_delimiter", "must not be empty"));
        }
        if format == WireFormat::Csv && self.serial.csv_delimiter.is_empty() {
            return Err(invalid("serial.csv_delimiter", "must not be empty"));
        }
        if self.storage.table.trim().is_empty() {
            return Err(invalid("storage.table", "must not be empty"));
        }
        if self.storage.path.trim().is_empty() {
            return Err(invalid("storage.path", "must not be empty"));
        }

        let encrypts = !self.serial.fields_to_encrypt.is_empty()
            || self.storage.encrypted_columns.values().any(|c| !c.is_empty())
            || self.storage.legacy_decrypt_probe;
        if encrypts && self.secret().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        Ok(())
    }

    pub fn wire_format(&self) -> Result<WireFormat> {
        self.serial
            .format
            .parse()
            .map_err(|_| ConfigError::UnsupportedFormat(self.serial.format.clone()))
    }

    pub fn endpoint(&self) -> Result<SerialEndpoint> {
        Ok(SerialEndpoint {
            path: self
                .serial
                .path
                .as_ref()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            baud_rate: self.serial.baud_rate,
            line_delimiter: unescape(&self.serial.line_delimiter),
            csv_delimiter: self.serial.csv_delimiter.clone(),
            format: self.wire_format()?,
            field_mapping: self.serial.field_mapping.clone(),
            required_fields: self.serial.required_fields.iter().cloned().collect(),
            fields_to_encrypt: self.serial.fields_to_encrypt.iter().cloned().collect(),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.serial.reconnect_delay_ms),
            max_retries: self.serial.max_retries,
        }
    }

    /// Declared columns are `storage.encrypted_columns` plus the ingest
    /// table's `fields_to_encrypt`.
    pub fn decrypt_policy(&self) -> DecryptPolicy {
        if self.storage.legacy_decrypt_probe {
            return DecryptPolicy::Opportunistic;
        }
        let mut tables: BTreeMap<String, BTreeSet<String>> = self
            .storage
            .encrypted_columns
            .iter()
            .map(|(table, columns)| (table.clone(), columns.iter().cloned().collect()))
            .collect();
        if !self.serial.fields_to_encrypt.is_empty() {
            tables
                .entry(self.storage.table.clone())
                .or_default()
                .extend(self.serial.fields_to_encrypt.iter().cloned());
        }
        DecryptPolicy::Declared(tables)
    }

    pub fn secret(&self) -> &str {
        self.security.secret.as_deref().unwrap_or("")
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.serial.startup_delay_ms)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Expand `\r`, `\n`, `\t` and `\\` escapes as written in TOML literal strings.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
