//! HTTP API over the gateway controller (axum).

pub mod dto;
pub mod handlers;
pub mod routes;

use utoipa::OpenApi;

pub use routes::{api_routes, AppState};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_parameters,
        handlers::set_parameter,
        handlers::health_check
    ),
    components(schemas(
        dto::ParameterDto,
        dto::ParametersResponse,
        dto::SetParameterRequest,
        dto::SetParameterResponse,
        dto::ErrorBody,
        dto::HealthResponse
    )),
    tags((name = "gm3srv", description = "GM3 heat-pump gateway API"))
)]
pub struct ApiDoc;
