//! Route table.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use utoipa::OpenApi;

use super::handlers;
use crate::core::engine::GatewayController;

pub type AppState = Arc<GatewayController>;

/// Build the API router over a running gateway controller.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/parameters", get(handlers::get_parameters))
        .route("/api/parameters/:name", post(handlers::set_parameter))
        .route("/health", get(handlers::health_check))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(super::ApiDoc::openapi()) }),
        )
        .with_state(state)
}
