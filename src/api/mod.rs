pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::store::AggregationStore;
use handlers::ApiDoc;

pub fn router(store: AggregationStore) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/api/v1/devices", post(handlers::ingest_readings))
        .route(
            "/api/v1/devices/{id}/latest",
            get(handlers::get_latest_timestamp),
        )
        .route(
            "/api/v1/devices/{id}/cumulative",
            get(handlers::get_cumulative_count),
        )
        .with_state(store)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
