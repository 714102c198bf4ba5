//! Request and response payload codecs for the GM3 parameter commands.
//!
//! Three payload families:
//!
//! - struct requests/responses (0x01/0x81 and 0x02/0x82): parameter metadata,
//!   paged. The WITH_RANGE variant appends a flag byte and a 4-byte min/max
//!   block per record; the panel variant carries an exponent byte instead and
//!   no range.
//! - value requests/responses (0x40/0xC0): batches of current values. The
//!   response concatenates `[index_lo][index_hi][value bytes]` per parameter;
//!   value widths come from the catalog's type codes.
//! - MODIFY_PARAM (0x29): `[index_lo][index_hi][encoded value]`.

use tracing::warn;

use super::value::{ParamType, ParamValue};
use crate::utils::error::{GatewayError, Result};

/// Writability flag inside the struct record's type byte (low 4 bits are the
/// type code).
const TYPE_WRITABLE_MASK: u8 = 0x20;
const TYPE_CODE_MASK: u8 = 0x0F;

/// Range flag byte semantics (WITH_RANGE variant).
const RANGE_MIN_IS_REF: u8 = 0x10;
const RANGE_MAX_IS_REF: u8 = 0x20;
const RANGE_NO_MIN: u8 = 0x40;
const RANGE_NO_MAX: u8 = 0x80;

/// Parameter metadata parsed from a struct response record.
#[derive(Debug, Clone, PartialEq)]
pub struct StructEntry {
    pub wire_index: u16,
    pub name: String,
    pub unit_code: u8,
    pub param_type: ParamType,
    pub writable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Index of another parameter whose live value is the bound, when the
    /// range flags mark the bound as dynamic.
    pub min_ref: Option<u16>,
    pub max_ref: Option<u16>,
    /// Display exponent byte from the panel struct variant, passed through
    /// unchanged for client-side interpretation.
    pub exponent: Option<i8>,
}

/// Map a struct-record unit string to the numeric unit code.
pub fn unit_code_from_str(unit: &str) -> u8 {
    match unit {
        "" => 0,
        "C" => 1,
        "s" => 2,
        "min" => 3,
        "h" => 4,
        "d" => 5,
        "%" => 6,
        "kW" => 7,
        "kWh" => 8,
        _ => 0,
    }
}

/// Build a struct request payload: `[count][first_lo][first_hi]`.
pub fn build_struct_request(first: u16, count: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(count);
    out.extend_from_slice(&first.to_le_bytes());
    out
}

/// Build a GET_PARAMS payload: `[first_lo][first_hi][count_lo][count_hi]`.
pub fn build_params_request(first: u16, count: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&first.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out
}

/// Build a MODIFY_PARAM payload: `[index_lo][index_hi][encoded value]`.
pub fn build_modify_request(wire_index: u16, value: &ParamValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 8);
    out.extend_from_slice(&wire_index.to_le_bytes());
    out.extend_from_slice(&value.encode());
    out
}

/// First wire index echoed in a struct response header (`[paramsNo][first]`).
pub fn struct_response_first_index(payload: &[u8]) -> Option<u16> {
    payload
        .get(1..3)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// First wire index of a value response (leading index of the first triple).
pub fn values_response_first_index(payload: &[u8]) -> Option<u16> {
    payload
        .get(0..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_cstr(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let rel = data.get(offset..)?.iter().position(|&b| b == 0)?;
    let text = String::from_utf8_lossy(&data[offset..offset + rel]).into_owned();
    Some((text, offset + rel + 1))
}

fn sanitise_name(raw: &str) -> String {
    raw.trim().replace(' ', "_")
}

/// Parse a GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE (0x82) payload.
///
/// Header: `[paramsNo][firstIndex_lo][firstIndex_hi]`, then per record:
/// `name\0 unit\0 type_byte range_flags min_lo min_hi max_lo max_hi`.
///
/// Returns the declared record count and the parsed entries. Truncated
/// records end the parse early; records with an unknown type code are
/// skipped but do not end it.
pub fn parse_struct_response(payload: &[u8]) -> Result<(u8, Vec<StructEntry>)> {
    let (params_no, first_index) = struct_header(payload)?;
    let mut entries = Vec::with_capacity(usize::from(params_no));
    let mut offset = 3;

    for i in 0..u16::from(params_no) {
        let Some((name, next)) = read_cstr(payload, offset) else {
            break;
        };
        let Some((unit, next)) = read_cstr(payload, next) else {
            break;
        };
        let Some(record) = payload.get(next..next + 6) else {
            break;
        };
        offset = next + 6;

        let type_byte = record[0];
        let flags = record[1];
        let wire_index = first_index + i;

        let Some(param_type) = ParamType::from_code(type_byte & TYPE_CODE_MASK) else {
            warn!(
                "Skipping param {} ({}): unknown type byte 0x{:02X}",
                wire_index, name, type_byte
            );
            continue;
        };

        let raw_min = [record[2], record[3]];
        let raw_max = [record[4], record[5]];

        let mut min = None;
        let mut min_ref = None;
        if flags & RANGE_MIN_IS_REF != 0 {
            min_ref = Some(u16::from_le_bytes(raw_min));
        } else if flags & RANGE_NO_MIN == 0 {
            min = Some(range_bound(raw_min, param_type));
        }

        let mut max = None;
        let mut max_ref = None;
        if flags & RANGE_MAX_IS_REF != 0 {
            max_ref = Some(u16::from_le_bytes(raw_max));
        } else if flags & RANGE_NO_MAX == 0 {
            max = Some(range_bound(raw_max, param_type));
        }

        entries.push(StructEntry {
            wire_index,
            name: sanitise_name(&name),
            unit_code: unit_code_from_str(&unit),
            param_type,
            writable: type_byte & TYPE_WRITABLE_MASK != 0,
            min,
            max,
            min_ref,
            max_ref,
            exponent: None,
        });
    }

    Ok((params_no, entries))
}

/// Parse a GET_PARAMS_STRUCT_RESPONSE (0x81) payload, the panel variant.
///
/// Per record: `name\0 unit\0 exponent_byte type_byte`, no range block.
pub fn parse_struct_response_no_range(payload: &[u8]) -> Result<(u8, Vec<StructEntry>)> {
    let (params_no, first_index) = struct_header(payload)?;
    let mut entries = Vec::with_capacity(usize::from(params_no));
    let mut offset = 3;

    for i in 0..u16::from(params_no) {
        let Some((name, next)) = read_cstr(payload, offset) else {
            break;
        };
        let Some((unit, next)) = read_cstr(payload, next) else {
            break;
        };
        let Some(record) = payload.get(next..next + 2) else {
            break;
        };
        offset = next + 2;

        let exponent = record[0] as i8;
        let type_byte = record[1];
        let wire_index = first_index + i;

        let Some(param_type) = ParamType::from_code(type_byte & TYPE_CODE_MASK) else {
            warn!(
                "Skipping panel param {} ({}): unknown type byte 0x{:02X}",
                wire_index, name, type_byte
            );
            continue;
        };

        entries.push(StructEntry {
            wire_index,
            name: sanitise_name(&name),
            unit_code: unit_code_from_str(&unit),
            param_type,
            writable: type_byte & TYPE_WRITABLE_MASK != 0,
            min: None,
            max: None,
            min_ref: None,
            max_ref: None,
            exponent: Some(exponent),
        });
    }

    Ok((params_no, entries))
}

fn struct_header(payload: &[u8]) -> Result<(u8, u16)> {
    if payload.len() < 3 {
        return Err(GatewayError::DataSizeError(format!(
            "struct response too short: {} bytes",
            payload.len()
        )));
    }
    Ok((payload[0], u16::from_le_bytes([payload[1], payload[2]])))
}

/// Parse a GET_PARAMS_RESPONSE (0xC0) payload: a concatenation of
/// `[index_lo][index_hi][value bytes]` triples. Value widths come from
/// `type_of`; an index it does not know aborts the parse at that byte
/// (catalog drift).
pub fn parse_values_response(
    payload: &[u8],
    mut type_of: impl FnMut(u16) -> Option<ParamType>,
) -> Result<Vec<(u16, ParamValue)>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let Some(index_bytes) = payload.get(offset..offset + 2) else {
            return Err(GatewayError::DataSizeError(format!(
                "truncated value index at offset {offset}"
            )));
        };
        let wire_index = u16::from_le_bytes([index_bytes[0], index_bytes[1]]);
        offset += 2;

        let param_type = type_of(wire_index).ok_or(GatewayError::CatalogDrift(wire_index))?;

        let consumed = match param_type.wire_size() {
            Some(width) => {
                if offset + width > payload.len() {
                    return Err(GatewayError::DataSizeError(format!(
                        "truncated {} value for index {wire_index}",
                        param_type.type_name()
                    )));
                }
                width
            }
            // Null-terminated string: consume through the terminator.
            None => match payload[offset..].iter().position(|&b| b == 0) {
                Some(rel) => rel + 1,
                None => {
                    return Err(GatewayError::DataSizeError(format!(
                        "unterminated string value for index {wire_index}"
                    )))
                }
            },
        };

        let value = ParamValue::decode(&payload[offset..offset + consumed], param_type)?;
        out.push((wire_index, value));
        offset += consumed;
    }

    Ok(out)
}

fn range_bound(raw: [u8; 2], ty: ParamType) -> f64 {
    if ty.is_signed() {
        f64::from(i16::from_le_bytes(raw))
    } else {
        f64::from(u16::from_le_bytes(raw))
    }
}
