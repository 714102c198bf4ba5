//! Periodic value refresh.
//!
//! Pages GET_PARAMS over every known wire index of both spaces, under the
//! caller's token hold. Each page updates the catalog atomically. A failed,
//! empty or malformed page is skipped and polling continues with the next
//! one; only transport loss aborts the cycle.

use chrono::Utc;
use tracing::{debug, warn};

use super::EngineConfig;
use crate::core::bus::arbiter::{BusArbiter, BusRequest, EchoCheck};
use crate::core::catalog::{AddressSpace, ParamCatalog};
use crate::core::protocol::constants::Command;
use crate::core::protocol::pdu::{build_params_request, parse_values_response};
use crate::utils::error::{GatewayError, Result};

/// Refresh every known parameter value once. Returns the number of catalog
/// entries updated.
pub async fn poll_cycle(
    bus: &mut BusArbiter,
    catalog: &ParamCatalog,
    config: &EngineConfig,
) -> Result<usize> {
    let mut updated_total = 0;

    for space in [AddressSpace::Regulator, AddressSpace::Panel] {
        let total = catalog.wire_count(space).await;
        if total == 0 {
            continue;
        }

        let destination = space.destination(config.controller_address);
        let mut first: u16 = 0;

        while first < total {
            let count = config.params_per_request.min(total - first);
            updated_total += poll_page(bus, catalog, space, destination, first, count).await?;
            first += count;
        }
    }

    Ok(updated_total)
}

async fn poll_page(
    bus: &mut BusArbiter,
    catalog: &ParamCatalog,
    space: AddressSpace,
    destination: u16,
    first: u16,
    count: u16,
) -> Result<usize> {
    let request = BusRequest::new(
        destination,
        Command::GetParams,
        build_params_request(first, count),
    )
    .accept_error_sentinels()
    .echo(EchoCheck::ValuesFirstIndex(first));

    let Some(reply) = bus.transact(&request).await? else {
        debug!(
            "{:?} poll page {}..{} got no reply, skipped",
            space,
            first,
            first + count
        );
        return Ok(0);
    };

    if reply.command == Command::NoData.code() {
        debug!("{:?} poll page at {} answered NO_DATA, skipped", space, first);
        return Ok(0);
    }
    if reply.command == Command::DataSizeError.code() {
        warn!(
            "{:?} poll page at {} answered DATA_SIZE_ERROR, batch aborted",
            space, first
        );
        return Ok(0);
    }

    let types = catalog.types_for_page(space, first, count).await;
    match parse_values_response(&reply.payload, |wire| types.get(&wire).copied()) {
        Ok(values) => {
            let updated = catalog.apply_values(space, &values, Utc::now()).await;
            debug!(
                "{:?} poll page at {}: {} values applied",
                space, first, updated
            );
            Ok(updated)
        }
        Err(GatewayError::CatalogDrift(wire)) => {
            // The controller reported an index we never discovered; the
            // batch cannot be trusted past that byte.
            warn!(
                "{:?} poll page at {} aborted: catalog drift at wire index {}",
                space, first, wire
            );
            Ok(0)
        }
        Err(e) => {
            warn!("{:?} poll page at {} malformed ({e}), skipped", space, first);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bus::address_book::AddressBook;
    use crate::core::bus::arbiter::{ArbiterConfig, BusArbiter};
    use crate::core::catalog::Parameter;
    use crate::core::protocol::constants::PANEL_ADDRESS;
    use crate::core::protocol::frame::Frame;
    use crate::core::protocol::value::{ParamType, ParamValue};
    use crate::core::transport::link::FrameLink;
    use crate::core::transport::mock::MockBus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn seed_param(space: AddressSpace, wire: u16, name: &str, ty: ParamType) -> Parameter {
        Parameter {
            catalog_index: space.catalog_index(wire),
            wire_index: wire,
            address_space: space,
            name: name.to_string(),
            unit_code: 0,
            param_type: ty,
            writable: false,
            min: None,
            max: None,
            exponent: None,
            current_value: None,
            last_update: None,
        }
    }

    async fn seeded_catalog() -> ParamCatalog {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![
                seed_param(AddressSpace::Regulator, 0, "BoilerTemp", ParamType::Int16),
                seed_param(AddressSpace::Regulator, 1, "HDWTSetPoint", ParamType::UInt8),
                seed_param(AddressSpace::Panel, 0, "PanelTemp", ParamType::Int16),
            ])
            .await;
        catalog
    }

    async fn run_poll(bus: &MockBus, catalog: &ParamCatalog, params_per_request: u16) -> usize {
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
                request_timeout: Duration::from_millis(1500),
            },
        );

        let config = EngineConfig {
            controller_address: 1,
            params_per_request,
        };
        let catalog = catalog.clone();
        arbiter
            .run_with_token(Some(Duration::from_secs(10)), move |bus_access| {
                Box::pin(async move { poll_cycle(bus_access, &catalog, &config).await })
            })
            .await
            .unwrap()
    }

    fn install_value_responder(bus: &MockBus) {
        bus.set_responder(move |frame| {
            if frame.command != 0x40 {
                return vec![];
            }
            let first = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
            let count = u16::from_le_bytes([frame.payload[2], frame.payload[3]]);

            let mut payload = Vec::new();
            if frame.destination == 1 {
                for wire in first..first + count {
                    payload.extend_from_slice(&wire.to_le_bytes());
                    match wire {
                        0 => payload.extend_from_slice(&21i16.to_le_bytes()),
                        1 => payload.push(47),
                        _ => return vec![],
                    }
                }
            } else {
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&(-5i16).to_le_bytes());
            }
            vec![Frame::new(frame.source, frame.destination, 0xC0, payload).encode()]
        });
    }

    #[tokio::test]
    async fn poll_updates_both_spaces() {
        let bus = MockBus::new();
        install_value_responder(&bus);
        let catalog = seeded_catalog().await;

        let updated = run_poll(&bus, &catalog, 100).await;
        assert_eq!(updated, 3);

        assert_eq!(
            catalog.get(0).await.unwrap().current_value,
            Some(ParamValue::Int16(21))
        );
        assert_eq!(
            catalog.get(1).await.unwrap().current_value,
            Some(ParamValue::UInt8(47))
        );
        assert_eq!(
            catalog.get(10_000).await.unwrap().current_value,
            Some(ParamValue::Int16(-5))
        );
        assert!(catalog.get(0).await.unwrap().last_update.is_some());
    }

    #[tokio::test]
    async fn poll_respects_page_size() {
        let bus = MockBus::new();
        install_value_responder(&bus);
        let catalog = seeded_catalog().await;

        run_poll(&bus, &catalog, 1).await;

        // Regulator space (2 wire indices) paged as 1+1, panel as 1.
        let polls: Vec<_> = bus
            .written_frames()
            .into_iter()
            .filter(|f| f.command == 0x40)
            .collect();
        assert_eq!(polls.len(), 3);
        assert_eq!(polls[0].payload, vec![0x00, 0x00, 0x01, 0x00]);
        assert_eq!(polls[1].payload, vec![0x01, 0x00, 0x01, 0x00]);
        assert_eq!(polls[2].destination, PANEL_ADDRESS);
    }

    #[tokio::test]
    async fn catalog_drift_aborts_batch_but_not_cycle() {
        let bus = MockBus::new();
        bus.set_responder(move |frame| {
            if frame.command != 0x40 {
                return vec![];
            }
            if frame.destination == 1 {
                // Unknown wire index 99 mid-batch.
                let mut payload = Vec::new();
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&21i16.to_le_bytes());
                payload.extend_from_slice(&99u16.to_le_bytes());
                payload.push(1);
                vec![Frame::new(frame.source, frame.destination, 0xC0, payload).encode()]
            } else {
                let mut payload = Vec::new();
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&(-5i16).to_le_bytes());
                vec![Frame::new(frame.source, frame.destination, 0xC0, payload).encode()]
            }
        });
        let catalog = seeded_catalog().await;

        let updated = run_poll(&bus, &catalog, 100).await;

        // Regulator batch aborted (drift), panel batch still applied.
        assert_eq!(updated, 1);
        assert_eq!(catalog.get(0).await.unwrap().current_value, None);
        assert_eq!(
            catalog.get(10_000).await.unwrap().current_value,
            Some(ParamValue::Int16(-5))
        );
    }

    #[tokio::test]
    async fn no_data_page_is_skipped() {
        let bus = MockBus::new();
        bus.set_responder(move |frame| {
            if frame.command != 0x40 {
                return vec![];
            }
            if frame.destination == 1 {
                vec![Frame::new(frame.source, frame.destination, 0x7F, vec![]).encode()]
            } else {
                let mut payload = Vec::new();
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&(-5i16).to_le_bytes());
                vec![Frame::new(frame.source, frame.destination, 0xC0, payload).encode()]
            }
        });
        let catalog = seeded_catalog().await;

        let updated = run_poll(&bus, &catalog, 100).await;
        assert_eq!(updated, 1);
    }
}
