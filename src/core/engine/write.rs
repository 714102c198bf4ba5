//! Parameter writes.
//!
//! Validation happens before any bus traffic: a write that fails the
//! writability, type or range checks never transmits a frame. The bus leg
//! issues MODIFY_PARAM under the caller's token hold, correlates the 0xA9
//! acknowledgement, and optimistically records the written value in the
//! catalog (the next poll overwrites it only if the controller disagrees).

use chrono::{DateTime, Utc};
use tracing::info;

use super::EngineConfig;
use crate::core::bus::arbiter::{BusArbiter, BusRequest};
use crate::core::catalog::{ParamCatalog, Parameter};
use crate::core::protocol::constants::Command;
use crate::core::protocol::pdu::build_modify_request;
use crate::core::protocol::value::ParamValue;
use crate::utils::error::{GatewayError, Result};

/// Result of an acknowledged write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub parameter: String,
    pub index: u32,
    pub old_value: Option<ParamValue>,
    pub new_value: ParamValue,
    pub timestamp: DateTime<Utc>,
}

/// Validate a proposed value against the parameter's metadata.
///
/// Pure; produces the encoded value for transmission or the semantic error
/// surfaced to the HTTP layer.
pub fn validate(param: &Parameter, proposed: &serde_json::Value) -> Result<ParamValue> {
    if !param.writable {
        return Err(GatewayError::NotWritable(param.name.clone()));
    }

    let value = ParamValue::from_json(proposed, param.param_type)?;

    if param.param_type.is_numeric() {
        if let Some(numeric) = value.as_f64() {
            if let Some(min) = param.min {
                if numeric < min {
                    return Err(GatewayError::OutOfRange(format!(
                        "{numeric} below minimum {min} for {}",
                        param.name
                    )));
                }
            }
            if let Some(max) = param.max {
                if numeric > max {
                    return Err(GatewayError::OutOfRange(format!(
                        "{numeric} above maximum {max} for {}",
                        param.name
                    )));
                }
            }
        }
    }

    Ok(value)
}

/// Transmit a validated write and correlate the acknowledgement.
pub async fn execute(
    bus: &mut BusArbiter,
    catalog: &ParamCatalog,
    config: &EngineConfig,
    param: &Parameter,
    value: ParamValue,
) -> Result<WriteOutcome> {
    let destination = param.address_space.destination(config.controller_address);
    let request = BusRequest::new(
        destination,
        Command::ModifyParam,
        build_modify_request(param.wire_index, &value),
    );

    let Some(reply) = bus.transact(&request).await? else {
        return Err(GatewayError::WriteTimeout);
    };

    // Acknowledgement payload byte 0 is the result code; 0x00 is success.
    let code = reply.payload.first().copied().unwrap_or(0);
    if code != 0 {
        return Err(GatewayError::WriteRejected(code));
    }

    let timestamp = Utc::now();
    catalog
        .record_written_value(param.catalog_index, value.clone(), timestamp)
        .await;
    info!("Parameter {} set to {}", param.name, value);

    Ok(WriteOutcome {
        parameter: param.name.clone(),
        index: param.catalog_index,
        old_value: param.current_value.clone(),
        new_value: value,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::address_book::AddressBook;
    use crate::core::bus::arbiter::{ArbiterConfig, BusArbiter};
    use crate::core::catalog::AddressSpace;
    use crate::core::protocol::constants::PANEL_ADDRESS;
    use crate::core::protocol::frame::Frame;
    use crate::core::protocol::value::ParamType;
    use crate::core::transport::link::FrameLink;
    use crate::core::transport::mock::MockBus;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setpoint_param() -> Parameter {
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
            last_update: None,
        }
    }

    #[test]
    fn validate_accepts_in_range() {
        let value = validate(&setpoint_param(), &json!(47)).unwrap();
        assert_eq!(value, ParamValue::UInt8(47));
        // Bounds are inclusive.
        assert!(validate(&setpoint_param(), &json!(35)).is_ok());
        assert!(validate(&setpoint_param(), &json!(65)).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(matches!(
            validate(&setpoint_param(), &json!(70)),
            Err(GatewayError::OutOfRange(_))
        ));
        assert!(matches!(
            validate(&setpoint_param(), &json!(34)),
            Err(GatewayError::OutOfRange(_))
        ));
    }

    #[test]
    fn validate_rejects_read_only_and_bad_types() {
        let mut read_only = setpoint_param();
        read_only.writable = false;
        assert!(matches!(
            validate(&read_only, &json!(47)),
            Err(GatewayError::NotWritable(_))
        ));

        assert!(matches!(
            validate(&setpoint_param(), &json!(47.5)),
            Err(GatewayError::BadValueType(_))
        ));
        assert!(matches!(
            validate(&setpoint_param(), &json!("47")),
            Err(GatewayError::BadValueType(_))
        ));
    }

    async fn run_write(
        bus: &MockBus,
        param: Parameter,
        value: ParamValue,
    ) -> (Result<WriteOutcome>, ParamCatalog) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("paired_address"), "132\n").unwrap();
        bus.push_frame(&Frame::new(
            132,
            PANEL_ADDRESS,
            0x68,
            vec![0x01, 0x08, 0x00, 0x00],
        ));

        let mut arbiter = BusArbiter::new(
            FrameLink::new(Box::new(bus.transport())),
            AddressBook::load(dir.path()),
            ArbiterConfig {
                token_required: true,
                request_timeout: Duration::from_millis(300),
            },
        );

        let catalog = ParamCatalog::new();
        catalog.insert_batch(vec![param.clone()]).await;
        let config = EngineConfig {
            controller_address: 1,
            params_per_request: 100,
        };

        let result = {
            let catalog = catalog.clone();
            arbiter
                .run_with_token(Some(Duration::from_secs(10)), move |bus_access| {
                    Box::pin(async move {
                        execute(bus_access, &catalog, &config, &param, value).await
                    })
                })
                .await
        };
        (result, catalog)
    }

    #[tokio::test]
    async fn acknowledged_write_updates_catalog() {
        let bus = MockBus::new();
        bus.set_responder(|frame| {
            if frame.command == 0x29 {
                vec![Frame::new(frame.source, frame.destination, 0xA9, vec![0x00]).encode()]
            } else {
                vec![]
            }
        });

        let (result, catalog) = run_write(&bus, setpoint_param(), ParamValue::UInt8(47)).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.parameter, "HDWTSetPoint");
        assert_eq!(outcome.old_value, Some(ParamValue::UInt8(45)));
        assert_eq!(outcome.new_value, ParamValue::UInt8(47));

        // MODIFY_PARAM payload: wire index LE + encoded value.
        let modify = bus
            .written_frames()
            .into_iter()
            .find(|f| f.command == 0x29)
            .unwrap();
        assert_eq!(modify.payload, vec![0x67, 0x00, 47]);
        assert_eq!(modify.destination, 1);

        // Optimistic catalog update.
        assert_eq!(
            catalog.get(103).await.unwrap().current_value,
            Some(ParamValue::UInt8(47))
        );
    }

    #[tokio::test]
    async fn rejected_write_surfaces_result_code() {
        let bus = MockBus::new();
        bus.set_responder(|frame| {
            if frame.command == 0x29 {
                vec![Frame::new(frame.source, frame.destination, 0xA9, vec![0x03]).encode()]
            } else {
                vec![]
            }
        });

        let (result, catalog) = run_write(&bus, setpoint_param(), ParamValue::UInt8(47)).await;
        assert!(matches!(result, Err(GatewayError::WriteRejected(0x03))));
        // No optimistic update on rejection.
        assert_eq!(
            catalog.get(103).await.unwrap().current_value,
            Some(ParamValue::UInt8(45))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_write_times_out() {
        let bus = MockBus::new();
        let (result, _catalog) = run_write(&bus, setpoint_param(), ParamValue::UInt8(47)).await;
        assert!(matches!(result, Err(GatewayError::WriteTimeout)));
    }
}
