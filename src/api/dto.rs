//! API data transfer objects and the error-to-status mapping.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::catalog::{CatalogSnapshot, Parameter};
use crate::core::engine::{HealthInfo, WriteOutcome};
use crate::utils::error::GatewayError;

/// One parameter as exposed over HTTP. `value` is a native JSON scalar
/// (number, boolean or string), `null` until first polled. The panel
/// space's display exponent is passed through verbatim when present.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ParameterDto {
    pub index: u32,
    pub name: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub type_code: u8,
    pub unit: u8,
    pub writable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponent: Option<i8>,
}

impl From<&Parameter> for ParameterDto {
    fn from(param: &Parameter) -> Self {
        Self {
            index: param.catalog_index,
            name: param.name.clone(),
            value: serde_json::to_value(&param.current_value)
                .unwrap_or(serde_json::Value::Null),
            type_code: param.param_type.code(),
            unit: param.unit_code,
            writable: param.writable,
            min: param.min,
            max: param.max,
            exponent: param.exponent,
        }
    }
}

/// Response for `GET /api/parameters`: parameters keyed by catalog index
/// (decimal string).
#[derive(Debug, Serialize, ToSchema)]
pub struct ParametersResponse {
    pub timestamp: DateTime<Utc>,
    pub parameters: BTreeMap<String, ParameterDto>,
}

impl From<CatalogSnapshot> for ParametersResponse {
    fn from(snapshot: CatalogSnapshot) -> Self {
        let parameters = snapshot
            .parameters
            .iter()
            .map(|(index, param)| (index.to_string(), ParameterDto::from(param)))
            .collect();
        Self {
            timestamp: snapshot.timestamp,
            parameters,
        }
    }
}

/// Body of `POST /api/parameters/{name}`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetParameterRequest {
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

/// Successful write acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct SetParameterResponse {
    pub success: bool,
    pub parameter: String,
    pub index: u32,
    #[schema(value_type = Object)]
    pub old_value: serde_json::Value,
    #[schema(value_type = Object)]
    pub new_value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl From<WriteOutcome> for SetParameterResponse {
    fn from(outcome: WriteOutcome) -> Self {
        Self {
            success: true,
            parameter: outcome.parameter,
            index: outcome.index,
            old_value: serde_json::to_value(&outcome.old_value)
                .unwrap_or(serde_json::Value::Null),
            new_value: serde_json::to_value(&outcome.new_value)
                .unwrap_or(serde_json::Value::Null),
            timestamp: outcome.timestamp,
        }
    }
}

/// Error body shared by all failure responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

/// Response for `GET /health`.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: u64,
    pub controller_connected: bool,
    pub parameters_count: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl From<HealthInfo> for HealthResponse {
    fn from(info: HealthInfo) -> Self {
        Self {
            status: info.status.as_str().to_string(),
            uptime: info.uptime_seconds,
            controller_connected: info.controller_connected,
            parameters_count: info.parameters_count,
            last_poll_at: info.last_poll_at,
        }
    }
}

/// Gateway errors mapped to HTTP statuses: semantic validation failures are
/// 400, unknown parameters 404, an unreachable bus 503, everything else 500.
pub struct AppError(pub GatewayError);

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::ParameterNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NotWritable(_)
            | GatewayError::BadValueType(_)
            | GatewayError::OutOfRange(_)
            | GatewayError::WriteRejected(_) => StatusCode::BAD_REQUEST,
            GatewayError::TokenTimeout
            | GatewayError::WriteTimeout
            | GatewayError::PortUnavailable(_)
            | GatewayError::Disconnected(_)
            | GatewayError::WriteFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            success: false,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::AddressSpace;
    use crate::core::protocol::value::{ParamType, ParamValue};
    use serde_json::json;

    fn sample_param() -> Parameter {
        Parameter {
            catalog_index: 103,
            wire_index: 103,
            address_space: AddressSpace::Regulator,
            name: "HDWTSetPoint".to_string(),
            unit_code: 1,
            param_type: ParamType::UInt8,
            writable: true,
            min: Some(35.0),
            max: Some(65.0),
            exponent: None,
            current_value: Some(ParamValue::UInt8(45)),
            last_update: Some(Utc::now()),
        }
    }

    #[test]
    fn parameter_dto_shape() {
        let dto = ParameterDto::from(&sample_param());
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["index"], json!(103));
        assert_eq!(json["name"], json!("HDWTSetPoint"));
        assert_eq!(json["value"], json!(45));
        assert_eq!(json["type"], json!(4));
        assert_eq!(json["unit"], json!(1));
        assert_eq!(json["writable"], json!(true));
        assert_eq!(json["min"], json!(35.0));
        assert_eq!(json["max"], json!(65.0));
        // No exponent key for regulator parameters.
        assert!(json.get("exponent").is_none());
    }

    #[test]
    fn parameter_dto_panel_exponent_passthrough() {
        let mut param = sample_param();
        param.exponent = Some(-1);
        let json = serde_json::to_value(ParameterDto::from(&param)).unwrap();
        assert_eq!(json["exponent"], json!(-1));
    }

    #[test]
    fn parameters_response_keys_are_decimal_strings() {
        let mut parameters = BTreeMap::new();
        parameters.insert(103, sample_param());
        let snapshot = CatalogSnapshot {
            timestamp: Utc::now(),
            parameters,
        };
        let response = ParametersResponse::from(snapshot);
        assert!(response.parameters.contains_key("103"));
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (
                GatewayError::ParameterNotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::BadValueType("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (GatewayError::OutOfRange("x".into()), StatusCode::BAD_REQUEST),
            (GatewayError::NotWritable("x".into()), StatusCode::BAD_REQUEST),
            (GatewayError::WriteRejected(3), StatusCode::BAD_REQUEST),
            (GatewayError::TokenTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::WriteTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (
                GatewayError::Disconnected("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::internal("x"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = AppError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
