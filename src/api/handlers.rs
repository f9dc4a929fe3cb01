use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, warn};
use utoipa::OpenApi;

use super::{
    dto::{
        CumulativeCountResponse, ErrorResponse, IngestReadingsRequest, LatestTimestampResponse,
        ReadingDto,
    },
    errors::ApiError,
};
use crate::store::AggregationStore;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Ingest a batch of readings for one device.
///
/// Readings whose timestamp is already stored for the device (including an
/// earlier entry in the same batch) are skipped without error.
#[utoipa::path(
    post,
    path = "/api/v1/devices",
    request_body = IngestReadingsRequest,
    responses(
        (status = 204, description = "Readings accepted (duplicates skipped)"),
        (status = 400, description = "Missing id, missing readings or malformed reading", body = ErrorResponse),
    ),
    tag = "devices"
)]
pub async fn ingest_readings(
    State(store): State<AggregationStore>,
    payload: Result<Json<IngestReadingsRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    let (device_id, readings) = request.validate().inspect_err(|_| {
        warn!("Rejected ingestion request with invalid data");
    })?;

    let summary = store.ingest_batch(&device_id, readings).await;
    info!(
        device_id = %device_id,
        accepted = summary.accepted,
        duplicates = summary.duplicates,
        overflowed = summary.overflowed,
        "Readings ingested"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// Timestamp of the newest reading stored for a device.
#[utoipa::path(
    get,
    path = "/api/v1/devices/{id}/latest",
    params(
        ("id" = String, Path, description = "Device identifier"),
    ),
    responses(
        (status = 200, description = "Latest reading timestamp", body = LatestTimestampResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
    ),
    tag = "devices"
)]
pub async fn get_latest_timestamp(
    State(store): State<AggregationStore>,
    Path(device_id): Path<String>,
) -> Result<Json<LatestTimestampResponse>, ApiError> {
    ensure_device(&store, &device_id).await?;
    let timestamp = store
        .latest_timestamp(&device_id)
        .await
        .ok_or(ApiError::DeviceNotFound)?;

    Ok(Json(LatestTimestampResponse {
        latest_timestamp: timestamp.as_str().to_owned(),
    }))
}

/// Sum of counts over every reading stored for a device.
#[utoipa::path(
    get,
    path = "/api/v1/devices/{id}/cumulative",
    params(
        ("id" = String, Path, description = "Device identifier"),
    ),
    responses(
        (status = 200, description = "Cumulative count", body = CumulativeCountResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
    ),
    tag = "devices"
)]
pub async fn get_cumulative_count(
    State(store): State<AggregationStore>,
    Path(device_id): Path<String>,
) -> Result<Json<CumulativeCountResponse>, ApiError> {
    ensure_device(&store, &device_id).await?;
    let cumulative_count = store
        .cumulative_count(&device_id)
        .await
        .ok_or(ApiError::DeviceNotFound)?;

    Ok(Json(CumulativeCountResponse { cumulative_count }))
}

async fn ensure_device(store: &AggregationStore, device_id: &str) -> Result<(), ApiError> {
    if store.has_device(device_id).await {
        Ok(())
    } else {
        Err(ApiError::DeviceNotFound)
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(ingest_readings, get_latest_timestamp, get_cumulative_count, health),
    components(schemas(
        IngestReadingsRequest,
        ReadingDto,
        LatestTimestampResponse,
        CumulativeCountResponse,
        ErrorResponse,
    )),
    tags(
        (name = "devices", description = "Device reading ingestion and aggregates"),
        (name = "system",  description = "System endpoints"),
    ),
    info(
        title = "Device Readings API",
        version = "0.1.0",
        description = "Ingests device readings and serves per-device aggregates"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
