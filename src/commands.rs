//! Command surface for UI collaborators. Every command answers with
//! `{success: true, data}` or `{success: false, error}`.

use serde::Serialize;
use serde_json::Value;

use crate::context::AppContext;
use crate::device::{LinkStatus, PortScan};
use crate::store::{Predicate, QueryFilter, QueryOptions, Record};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> CommandResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err("Empty response".to_string()),
        }
    }
}

impl<T> From<Result<T, String>> for CommandResponse<T> {
    fn from(result: Result<T, String>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Affected {
    pub changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inserted {
    pub id: i64,
}

/// Connect to the configured or auto-detected serial port
pub async fn serial_connect(ctx: &AppContext) -> CommandResponse<LinkStatus> {
    match ctx.device().connect().await {
        Ok(()) => CommandResponse::ok(ctx.device().status().await),
        Err(e) => CommandResponse::err(format!("Failed to connect: {}", e)),
    }
}

/// Disconnect and suppress automatic reconnection
pub async fn serial_disconnect(ctx: &AppContext) -> CommandResponse<LinkStatus> {
    match ctx.device().disconnect().await {
        Ok(()) => CommandResponse::ok(ctx.device().status().await),
        Err(e) => CommandResponse::err(format!("Failed to disconnect: {}", e)),
    }
}

pub async fn serial_force_reconnect(ctx: &AppContext) -> CommandResponse<LinkStatus> {
    match ctx.device().force_reconnect().await {
        Ok(()) => CommandResponse::ok(ctx.device().status().await),
        Err(e) => CommandResponse::err(format!("Failed to reconnect: {}", e)),
    }
}

pub async fn serial_get_status(ctx: &AppContext) -> CommandResponse<LinkStatus> {
    CommandResponse::ok(ctx.device().status().await)
}

pub async fn serial_scan_ports(ctx: &AppContext) -> CommandResponse<PortScan> {
    ctx.device()
        .scan_for_better_ports()
        .await
        .map_err(|e| format!("Failed to scan ports: {}", e))
        .into()
}

pub async fn serial_toggle_dynamic_switching(ctx: &AppContext, enabled: bool) -> CommandResponse<LinkStatus> {
    ctx.device().set_dynamic_port_switching(enabled).await;
    CommandResponse::ok(ctx.device().status().await)
}

/// Write raw text to the device
pub async fn serial_send_data(ctx: &AppContext, data: &str) -> CommandResponse<usize> {
    ctx.device()
        .send_data(data.as_bytes())
        .await
        .map_err(|e| format!("Failed to send data: {}", e))
        .into()
}

pub async fn db_insert(ctx: &AppContext, table: &str, record: &Record) -> CommandResponse<Inserted> {
    ctx.db()
        .insert(table, record)
        .await
        .map(|id| Inserted { id })
        .map_err(|e| format!("Insert failed: {}", e))
        .into()
}

pub async fn db_update(
    ctx: &AppContext,
    table: &str,
    record: &Record,
    predicates: &[Predicate],
) -> CommandResponse<Affected> {
    ctx.db()
        .update(table, record, predicates)
        .await
        .map(|changes| Affected { changes })
        .map_err(|e| format!("Update failed: {}", e))
        .into()
}

pub async fn db_select(
    ctx: &AppContext,
    table: &str,
    filters: &QueryFilter,
    options: &QueryOptions,
) -> CommandResponse<Vec<Record>> {
    ctx.db()
        .select(table, filters, options)
        .await
        .map_err(|e| format!("Select failed: {}", e))
        .into()
}

pub async fn db_delete(ctx: &AppContext, table: &str, predicates: &[Predicate]) -> CommandResponse<Affected> {
    ctx.db()
        .delete(table, predicates)
        .await
        .map(|changes| Affected { changes })
        .map_err(|e| format!("Delete failed: {}", e))
        .into()
}

/// Validate, encrypt and store one reading in the ingest table
pub async fn ingest_reading(ctx: &AppContext, body: Value) -> CommandResponse<Inserted> {
    ctx.pipeline()
        .ingest_json(body)
        .await
        .map(|id| Inserted { id })
        .map_err(|e| format!("Failed to store reading: {}", e))
        .into()
}
