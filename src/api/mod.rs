//! HTTP ingress and data API.
//!
//! Every failure answers `{success: false, error}` with a 4xx/5xx status.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::AppContext;
use crate::device::DeviceError;
use crate::ingest::IngestError;
use crate::store::{OrderBy, Predicate, QueryFilter, QueryOptions, Record, StoreError};

pub type ApiState = Arc<AppContext>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_store(context: &str, e: StoreError) -> Self {
        match e {
            StoreError::InvalidInput(_) => Self::bad_request(format!("{}: {}", context, e)),
            other => Self::internal(format!("{}: {}", context, other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "success": false, "error": self.message }))).into_response()
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/sensor-data", post(post_sensor_data))
        .route(
            "/api/data",
            post(insert_records)
                .get(query_records_by_params)
                .put(update_records)
                .delete(delete_records),
        )
        .route("/api/data/query", post(query_records))
        .route("/api/serial/status", get(serial_status))
        .route("/api/serial/connect", post(serial_connect))
        .route("/api/serial/disconnect", post(serial_disconnect))
        .route("/api/serial/reconnect", post(serial_reconnect))
        .route("/api/serial/scan", post(serial_scan))
        .route("/api/serial/send", post(serial_send))
        .route("/api/serial/dynamic-switching", post(serial_dynamic_switching))
        .with_state(state)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve<F>(state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config().api.bind, state.config().api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("HTTP API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn parse_body<T: DeserializeOwned>(payload: Result<Json<Value>, JsonRejection>) -> Result<T, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?;
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("Invalid request: {}", e)))
}

fn require_table(table: &str) -> Result<(), ApiError> {
    if table.trim().is_empty() {
        return Err(ApiError::bad_request("A 'tableName' string is required."));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInsertRequest {
    pub table_name: String,
    pub records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub table_name: String,
    #[serde(default)]
    pub filters: QueryFilter,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub table_name: String,
    pub update_data: Record,
    #[serde(rename = "where")]
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub table_name: String,
    #[serde(rename = "where")]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub confirm_deletion: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct DynamicSwitchingRequest {
    pub enabled: bool,
}

pub async fn health_check(State(ctx): State<ApiState>) -> ApiResult {
    match ctx.db().ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Database is connected.",
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )),
        Err(e) => Err(ApiError::internal(format!("Database connectivity issue: {}", e))),
    }
}

/// One reading from an external producer, validated like a serial line
pub async fn post_sensor_data(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let body: Value = parse_body(payload)?;
    match ctx.pipeline().ingest_json(body).await {
        Ok(id) => Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id })))),
        Err(IngestError::Store(e)) => Err(ApiError::from_store("Failed to store reading", e)),
        Err(e) => Err(ApiError::bad_request(e.to_string())),
    }
}

pub async fn insert_records(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: BatchInsertRequest = parse_body(payload)?;
    require_table(&request.table_name)?;
    if request.records.is_empty() {
        return Err(ApiError::bad_request("A non-empty 'records' array is required."));
    }

    let total = request.records.len();
    let mut inserted_ids = Vec::with_capacity(total);
    let mut errors = Vec::new();
    for (index, record) in request.records.into_iter().enumerate() {
        let result = match &record {
            Value::Object(fields) => ctx.db().insert(&request.table_name, fields).await.map_err(|e| e.to_string()),
            _ => Err("record must be a JSON object".to_string()),
        };
        match result {
            Ok(id) => inserted_ids.push(id),
            Err(error) => errors.push(json!({ "index": index, "record": record, "error": error })),
        }
    }

    if !errors.is_empty() {
        log::warn!(
            "Batch insert into {}: {} of {} record(s) failed",
            request.table_name,
            errors.len(),
            total
        );
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": format!("Processed {} records. Some failed to insert into '{}'.", total, request.table_name),
                "processedCount": inserted_ids.len(),
                "failedCount": errors.len(),
                "errors": errors,
            })),
        ));
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Successfully inserted {} records into '{}'.", inserted_ids.len(), request.table_name),
            "insertedIds": inserted_ids,
        })),
    ))
}

pub async fn query_records(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: QueryRequest = parse_body(payload)?;
    select(&ctx, request).await
}

/// `GET /api/data?tableName=t&orderBy=id%20DESC&limit=10&col=value`
pub async fn query_records_by_params(
    State(ctx): State<ApiState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> ApiResult {
    let table_name = params.remove("tableName").unwrap_or_default();
    let mut options = QueryOptions::new();
    if let Some(order) = params.remove("orderBy") {
        options.order_by = OrderBy::parse(&order);
    }
    if let Some(limit) = params.remove("limit") {
        options.limit = limit.trim().parse::<u64>().ok().filter(|n| *n > 0);
    }
    let filters: QueryFilter = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();

    select(
        &ctx,
        QueryRequest {
            table_name,
            filters,
            options,
        },
    )
    .await
}

async fn select(ctx: &AppContext, request: QueryRequest) -> ApiResult {
    require_table(&request.table_name)?;
    let rows = ctx
        .db()
        .select(&request.table_name, &request.filters, &request.options)
        .await
        .map_err(|e| {
            log::error!("Error retrieving data from {}: {}", request.table_name, e);
            ApiError::from_store(&format!("Failed to retrieve data from '{}'", request.table_name), e)
        })?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "tableName": request.table_name,
            "count": rows.len(),
            "filters": (!request.filters.is_empty()).then_some(&request.filters),
            "options": request.options,
            "data": rows,
        })),
    ))
}

pub async fn update_records(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: UpdateRequest = parse_body(payload)?;
    require_table(&request.table_name)?;
    if request.update_data.is_empty() {
        return Err(ApiError::bad_request("An 'updateData' object with at least one field is required."));
    }
    if request.predicates.is_empty() {
        return Err(ApiError::bad_request("A non-empty 'where' predicate list is required."));
    }

    let changes = ctx
        .db()
        .update(&request.table_name, &request.update_data, &request.predicates)
        .await
        .map_err(|e| ApiError::from_store(&format!("Failed to update data in '{}'", request.table_name), e))?;

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "affectedRows": changes })),
    ))
}

pub async fn delete_records(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: DeleteRequest = parse_body(payload)?;
    require_table(&request.table_name)?;
    if request.predicates.is_empty() {
        return Err(ApiError::bad_request("A non-empty 'where' predicate list is required."));
    }
    if !request.confirm_deletion {
        return Err(ApiError::bad_request(
            "Set 'confirmDeletion: true' to confirm you want to delete data.",
        ));
    }

    let deleted = ctx
        .db()
        .delete(&request.table_name, &request.predicates)
        .await
        .map_err(|e| ApiError::from_store(&format!("Failed to delete data from '{}'", request.table_name), e))?;

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "deletedRows": deleted })),
    ))
}

fn device_error(context: &str, e: DeviceError) -> ApiError {
    match e {
        DeviceError::NotConnected => ApiError {
            status: StatusCode::CONFLICT,
            message: format!("{}: {}", context, e),
        },
        other => ApiError::internal(format!("{}: {}", context, other)),
    }
}

async fn status_body(ctx: &AppContext) -> Json<Value> {
    Json(json!({ "success": true, "data": ctx.device().status().await }))
}

pub async fn serial_status(State(ctx): State<ApiState>) -> ApiResult {
    Ok((StatusCode::OK, status_body(&ctx).await))
}

pub async fn serial_connect(State(ctx): State<ApiState>) -> ApiResult {
    ctx.device()
        .connect()
        .await
        .map_err(|e| device_error("Failed to connect", e))?;
    Ok((StatusCode::OK, status_body(&ctx).await))
}

pub async fn serial_disconnect(State(ctx): State<ApiState>) -> ApiResult {
    ctx.device()
        .disconnect()
        .await
        .map_err(|e| device_error("Failed to disconnect", e))?;
    Ok((StatusCode::OK, status_body(&ctx).await))
}

pub async fn serial_reconnect(State(ctx): State<ApiState>) -> ApiResult {
    ctx.device()
        .force_reconnect()
        .await
        .map_err(|e| device_error("Failed to reconnect", e))?;
    Ok((StatusCode::OK, status_body(&ctx).await))
}

pub async fn serial_scan(State(ctx): State<ApiState>) -> ApiResult {
    let scan = ctx
        .device()
        .scan_for_better_ports()
        .await
        .map_err(|e| device_error("Failed to scan ports", e))?;
    Ok((StatusCode::OK, Json(json!({ "success": true, "data": scan }))))
}

pub async fn serial_send(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: SendRequest = parse_body(payload)?;
    let bytes = ctx
        .device()
        .send_data(request.data.as_bytes())
        .await
        .map_err(|e| device_error("Failed to send data", e))?;
    Ok((StatusCode::OK, Json(json!({ "success": true, "bytes": bytes }))))
}

pub async fn serial_dynamic_switching(
    State(ctx): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: DynamicSwitchingRequest = parse_body(payload)?;
    ctx.device().set_dynamic_port_switching(request.enabled).await;
    Ok((StatusCode::OK, status_body(&ctx).await))
}
