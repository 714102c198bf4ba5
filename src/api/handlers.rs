//! HTTP request handlers.

use axum::extract::{Path, State};
use axum::Json;
use tracing::info;

use super::dto::{
    AppError, HealthResponse, ParametersResponse, SetParameterRequest,
    SetParameterResponse,
};
use super::routes::AppState;
use crate::core::catalog::ParamSelector;
use crate::utils::error::GatewayError;

/// All cached parameter values.
///
/// @route GET /api/parameters
#[utoipa::path(
    get,
    path = "/api/parameters",
    responses(
        (status = 200, description = "Catalog snapshot", body = ParametersResponse),
        (status = 503, description = "Controller not connected", body = ErrorBody)
    ),
    tag = "gm3srv"
)]
pub async fn get_parameters(
    State(state): State<AppState>,
) -> Result<Json<ParametersResponse>, AppError> {
    let health = state.health().await;
    if !health.controller_connected {
        return Err(AppError(GatewayError::Disconnected(
            "controller not connected".to_string(),
        )));
    }

    let snapshot = state.read_all().await;
    Ok(Json(ParametersResponse::from(snapshot)))
}

/// Write a parameter value.
///
/// The path segment selects by name, or by catalog index when numeric.
///
/// @route POST /api/parameters/{name}
#[utoipa::path(
    post,
    path = "/api/parameters/{name}",
    params(("name" = String, Path, description = "Parameter name or catalog index")),
    request_body = SetParameterRequest,
    responses(
        (status = 200, description = "Write acknowledged", body = SetParameterResponse),
        (status = 400, description = "Type or range rejection", body = ErrorBody),
        (status = 404, description = "Unknown parameter", body = ErrorBody),
        (status = 503, description = "Bus unavailable", body = ErrorBody)
    ),
    tag = "gm3srv"
)]
pub async fn set_parameter(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SetParameterRequest>,
) -> Result<Json<SetParameterResponse>, AppError> {
    let selector = ParamSelector::parse(&name);
    let outcome = state.write(selector, request.value).await?;
    info!(
        "Write accepted: {} = {} (was {:?})",
        outcome.parameter, outcome.new_value, outcome.old_value
    );
    Ok(Json(SetParameterResponse::from(outcome)))
}

/// Service health.
///
/// @route GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Health snapshot", body = HealthResponse)),
    tag = "gm3srv"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::from(state.health().await))
}
