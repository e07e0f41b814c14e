use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::decoder::DecodeError;

/// Serialization contract of one line coming off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    JsonObject,
    JsonArray,
    Csv,
    Raw,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::JsonObject => "json-object",
            WireFormat::JsonArray => "json-array",
            WireFormat::Csv => "csv",
            WireFormat::Raw => "raw",
        }
    }

    /// Positional formats need a field mapping to name their values.
    pub fn needs_mapping(&self) -> bool {
        matches!(self, WireFormat::JsonArray | WireFormat::Csv)
    }
}

impl FromStr for WireFormat {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json-object" | "json_object" | "json" => Ok(WireFormat::JsonObject),
            "json-array" | "json_array" => Ok(WireFormat::JsonArray),
            "csv" => Ok(WireFormat::Csv),
            "raw" => Ok(WireFormat::Raw),
            other => Err(DecodeError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open and interpret one serial device.
///
/// Built once from configuration and never mutated afterwards; the device
/// manager hands out clones to each connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialEndpoint {
    /// Fixed port path, or `None` to auto-detect on every attempt.
    pub path: Option<String>,
    pub baud_rate: u32,
    pub line_delimiter: String,
    pub csv_delimiter: String,
    pub format: WireFormat,
    pub field_mapping: Vec<String>,
    pub required_fields: BTreeSet<String>,
    pub fields_to_encrypt: BTreeSet<String>,
}

impl Default for SerialEndpoint {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: 9600,
            line_delimiter: "\r\n".to_string(),
            csv_delimiter: ",".to_string(),
            format: WireFormat::JsonObject,
            field_mapping: Vec::new(),
            required_fields: BTreeSet::new(),
            fields_to_encrypt: BTreeSet::new(),
        }
    }
}
