use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::endpoint::{SerialEndpoint, WireFormat};

/// Field name used by the raw format when no mapping is configured.
pub const RAW_FIELD: &str = "raw";
/// Capture timestamp added by the raw format.
pub const CAPTURED_AT_FIELD: &str = "captured_at";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Expected {expected} values, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Unsupported wire format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field '{0}'")]
    MissingField(String),
}

/// One decoded, field-named record from a single serial line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading {
    fields: Map<String, Value>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when the field exists, is not null and is not a blank string.
    pub fn has_value(&self, field: &str) -> bool {
        match self.fields.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    /// First required field without a value, in set order.
    pub fn validate(&self, required: &BTreeSet<String>) -> Result<(), ValidationError> {
        match required.iter().find(|field| !self.has_value(field)) {
            Some(field) => Err(ValidationError::MissingField(field.clone())),
            None => Ok(()),
        }
    }
}

/// Parse a token as a decimal number. Hex, `NaN` and infinities stay strings.
pub fn parse_number(token: &str) -> Option<Number> {
    let token = token.trim();
    if token.is_empty()
        || !token.bytes().any(|b| b.is_ascii_digit())
        || !token
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    if let Ok(int) = token.parse::<i64>() {
        return Some(int.into());
    }
    token.parse::<f64>().ok().and_then(Number::from_f64)
}

fn csv_value(token: &str) -> Value {
    let token = token.trim();
    match parse_number(token) {
        Some(n) => Value::Number(n),
        None => Value::String(token.to_string()),
    }
}

/// Decode one line with the default `,` csv delimiter.
///
/// `Ok(None)` means the line was blank and is skipped without error.
pub fn decode(raw: &str, format: WireFormat, mapping: &[String]) -> Result<Option<Reading>, DecodeError> {
    decode_with(raw, format, mapping, ",")
}

pub fn decode_with(
    raw: &str,
    format: WireFormat,
    mapping: &[String],
    csv_delimiter: &str,
) -> Result<Option<Reading>, DecodeError> {
    let line = raw.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let reading = match format {
        WireFormat::JsonObject => {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
            match value {
                Value::Object(fields) => Reading::from_fields(fields),
                other => {
                    return Err(DecodeError::InvalidJson(format!(
                        "expected an object, got {}",
                        json_kind(&other)
                    )))
                }
            }
        }
        WireFormat::JsonArray => {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
            let items = match value {
                Value::Array(items) => items,
                _ => {
                    return Err(DecodeError::ArityMismatch {
                        expected: mapping.len(),
                        actual: 0,
                    })
                }
            };
            if items.len() != mapping.len() {
                return Err(DecodeError::ArityMismatch {
                    expected: mapping.len(),
                    actual: items.len(),
                });
            }
            let mut reading = Reading::new();
            for (field, item) in mapping.iter().zip(items) {
                reading.insert(field.clone(), item);
            }
            reading
        }
        WireFormat::Csv => {
            let tokens: Vec<&str> = line.split(csv_delimiter).collect();
            if tokens.len() != mapping.len() {
                return Err(DecodeError::ArityMismatch {
                    expected: mapping.len(),
                    actual: tokens.len(),
                });
            }
            let mut reading = Reading::new();
            for (field, token) in mapping.iter().zip(tokens) {
                reading.insert(field.clone(), csv_value(token));
            }
            reading
        }
        WireFormat::Raw => {
            let field = mapping.first().map(String::as_str).unwrap_or(RAW_FIELD);
            let mut reading = Reading::new();
            reading.insert(field, Value::String(line.to_string()));
            reading.insert(CAPTURED_AT_FIELD, Value::String(chrono::Utc::now().to_rfc3339()));
            reading
        }
    };

    Ok(Some(reading))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Line decoder bound to one endpoint's wire format and validation rules.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    format: WireFormat,
    field_mapping: Vec<String>,
    csv_delimiter: String,
    required_fields: BTreeSet<String>,
}

impl FrameDecoder {
    pub fn new(endpoint: &SerialEndpoint) -> Self {
        Self {
            format: endpoint.format,
            field_mapping: endpoint.field_mapping.clone(),
            csv_delimiter: endpoint.csv_delimiter.clone(),
            required_fields: endpoint.required_fields.clone(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn required_fields(&self) -> &BTreeSet<String> {
        &self.required_fields
    }

    pub fn decode(&self, raw: &str) -> Result<Option<Reading>, DecodeError> {
        decode_with(raw, self.format, &self.field_mapping, &self.csv_delimiter)
    }

    pub fn validate(&self, reading: &Reading) -> Result<(), ValidationError> {
        reading.validate(&self.required_fields)
    }
}
