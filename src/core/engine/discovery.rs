//! Parameter discovery.
//!
//! One-shot catalog build, run under a single token hold: a GET_SETTINGS
//! broadcast to wake the controller, then paged struct requests over the
//! regulator space (0x02, with ranges) followed by the panel space (0x01,
//! exponent + type, stored at catalog index 10000+). Paging a space ends on
//! NO_DATA, an empty page, or three consecutive batch failures.

use tracing::{debug, info, warn};

use super::EngineConfig;
use crate::core::bus::arbiter::{BusArbiter, BusRequest, EchoCheck};
use crate::core::catalog::{AddressSpace, ParamCatalog, Parameter};
use crate::core::protocol::constants::{Command, BROADCAST_ADDRESS};
use crate::core::protocol::pdu::{
    build_struct_request, parse_struct_response, parse_struct_response_no_range,
};
use crate::utils::error::Result;

/// Wire page size for struct requests.
pub const STRUCT_PAGE_SIZE: u8 = 100;

const MAX_BATCH_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryReport {
    pub regulator: usize,
    pub panel: usize,
}

impl DiscoveryReport {
    pub fn total(&self) -> usize {
        self.regulator + self.panel
    }
}

/// Build the catalog. Requires the caller to hold the bus (runs inside
/// `run_with_token`).
pub async fn run(
    bus: &mut BusArbiter,
    catalog: &ParamCatalog,
    config: &EngineConfig,
) -> Result<DiscoveryReport> {
    send_get_settings(bus).await?;

    let mut report = DiscoveryReport::default();
    for space in [AddressSpace::Regulator, AddressSpace::Panel] {
        let count = discover_space(bus, catalog, config, space).await?;
        match space {
            AddressSpace::Regulator => report.regulator = count,
            AddressSpace::Panel => report.panel = count,
        }
    }

    info!(
        "Discovery complete: {} parameters ({} regulator, {} panel)",
        report.total(),
        report.regulator,
        report.panel
    );
    Ok(report)
}

/// First exchange after a token grant: GET_SETTINGS to the broadcast
/// address. The controller treats it as a session opener; no reply is
/// non-critical.
async fn send_get_settings(bus: &mut BusArbiter) -> Result<()> {
    let request = BusRequest::new(BROADCAST_ADDRESS, Command::GetSettings, Vec::new()).attempts(1);
    match bus.transact(&request).await? {
        Some(reply) => debug!("GET_SETTINGS answered ({} bytes)", reply.payload.len()),
        None => debug!("GET_SETTINGS got no reply (non-critical)"),
    }
    Ok(())
}

async fn discover_space(
    bus: &mut BusArbiter,
    catalog: &ParamCatalog,
    config: &EngineConfig,
    space: AddressSpace,
) -> Result<usize> {
    let destination = space.destination(config.controller_address);
    let mut wire_index: u16 = 0;
    let mut failures: u32 = 0;
    let mut added = 0usize;

    loop {
        let request = BusRequest::new(
            destination,
            space.struct_command(),
            build_struct_request(wire_index, STRUCT_PAGE_SIZE),
        )
        .accept_error_sentinels()
        .echo(EchoCheck::StructFirstIndex(wire_index));

        let Some(reply) = bus.transact(&request).await? else {
            failures += 1;
            if failures >= MAX_BATCH_FAILURES {
                warn!(
                    "Ending {:?} discovery at wire index {} after {} failed batches",
                    space, wire_index, failures
                );
                break;
            }
            continue;
        };
        failures = 0;

        if reply.command == Command::NoData.code() {
            debug!("{:?} space exhausted at wire index {}", space, wire_index);
            break;
        }
        if reply.command == Command::DataSizeError.code() {
            warn!(
                "Controller reported DATA_SIZE_ERROR for {:?} struct page at {}",
                space, wire_index
            );
            break;
        }

        let parsed = match space {
            AddressSpace::Regulator => parse_struct_response(&reply.payload),
            AddressSpace::Panel => parse_struct_response_no_range(&reply.payload),
        };
        let (declared, entries) = match parsed {
            Ok(page) => page,
            Err(e) => {
                warn!("Malformed {:?} struct page at {} ({e})", space, wire_index);
                failures += 1;
                if failures >= MAX_BATCH_FAILURES {
                    break;
                }
                continue;
            }
        };

        if declared == 0 || entries.is_empty() {
            debug!("Empty {:?} struct page at wire index {}", space, wire_index);
            break;
        }
        if entries.len() < usize::from(declared) {
            warn!(
                "Short {:?} struct page at {}: {}/{} records parsed",
                space,
                wire_index,
                entries.len(),
                declared
            );
        }

        let params: Vec<Parameter> = entries
            .into_iter()
            .map(|entry| Parameter::from_struct_entry(space, entry))
            .collect();
        added += catalog.insert_batch(params).await;

        // Next page picks up after the records the controller declared.
        wire_index = wire_index.saturating_add(u16::from(declared));
    }

    Ok(added)
}
