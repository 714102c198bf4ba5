//! Typed parameter values and their wire codec.
//!
//! All numeric types are little-endian. BOOL is a single byte, STRING is
//! null-terminated UTF-8. DOUBLE and the 64-bit integers are rare on real
//! hardware but part of the wire type set and fully supported.

use serde::Serialize;

use crate::utils::error::{GatewayError, Result};

/// Parameter data type codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ParamType {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    UInt8 = 4,
    UInt16 = 5,
    UInt32 = 6,
    Float = 7,
    Double = 9,
    Bool = 10,
    String = 12,
    Int64 = 13,
    UInt64 = 14,
}

impl ParamType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ParamType::Int8),
            2 => Some(ParamType::Int16),
            3 => Some(ParamType::Int32),
            4 => Some(ParamType::UInt8),
            5 => Some(ParamType::UInt16),
            6 => Some(ParamType::UInt32),
            7 => Some(ParamType::Float),
            9 => Some(ParamType::Double),
            10 => Some(ParamType::Bool),
            12 => Some(ParamType::String),
            13 => Some(ParamType::Int64),
            14 => Some(ParamType::UInt64),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Fixed wire width in bytes; `None` for the variable-length STRING.
    pub const fn wire_size(self) -> Option<usize> {
        match self {
            ParamType::Int8 | ParamType::UInt8 | ParamType::Bool => Some(1),
            ParamType::Int16 | ParamType::UInt16 => Some(2),
            ParamType::Int32 | ParamType::UInt32 | ParamType::Float => Some(4),
            ParamType::Int64 | ParamType::UInt64 | ParamType::Double => Some(8),
            ParamType::String => None,
        }
    }

    pub const fn type_name(self) -> &'static str {
        match self {
            ParamType::Int8 => "int8",
            ParamType::Int16 => "int16",
            ParamType::Int32 => "int32",
            ParamType::UInt8 => "uint8",
            ParamType::UInt16 => "uint16",
            ParamType::UInt32 => "uint32",
            ParamType::Float => "float",
            ParamType::Double => "double",
            ParamType::Bool => "bool",
            ParamType::String => "string",
            ParamType::Int64 => "int64",
            ParamType::UInt64 => "uint64",
        }
    }

    pub const fn is_numeric(self) -> bool {
        !matches!(self, ParamType::Bool | ParamType::String)
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            ParamType::Int8
                | ParamType::Int16
                | ParamType::Int32
                | ParamType::Int64
                | ParamType::Float
                | ParamType::Double
        )
    }
}

/// A decoded parameter value, tagged by wire type.
///
/// Serialises to native JSON scalars (numbers, booleans, strings).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Int8(_) => ParamType::Int8,
            ParamValue::Int16(_) => ParamType::Int16,
            ParamValue::Int32(_) => ParamType::Int32,
            ParamValue::Int64(_) => ParamType::Int64,
            ParamValue::UInt8(_) => ParamType::UInt8,
            ParamValue::UInt16(_) => ParamType::UInt16,
            ParamValue::UInt32(_) => ParamType::UInt32,
            ParamValue::UInt64(_) => ParamType::UInt64,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Double(_) => ParamType::Double,
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Text(_) => ParamType::String,
        }
    }

    /// Encode for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ParamValue::Int8(v) => v.to_le_bytes().to_vec(),
            ParamValue::Int16(v) => v.to_le_bytes().to_vec(),
            ParamValue::Int32(v) => v.to_le_bytes().to_vec(),
            ParamValue::Int64(v) => v.to_le_bytes().to_vec(),
            ParamValue::UInt8(v) => v.to_le_bytes().to_vec(),
            ParamValue::UInt16(v) => v.to_le_bytes().to_vec(),
            ParamValue::UInt32(v) => v.to_le_bytes().to_vec(),
            ParamValue::UInt64(v) => v.to_le_bytes().to_vec(),
            ParamValue::Float(v) => v.to_le_bytes().to_vec(),
            ParamValue::Double(v) => v.to_le_bytes().to_vec(),
            ParamValue::Bool(v) => vec![u8::from(*v)],
            ParamValue::Text(v) => {
                let mut out = v.as_bytes().to_vec();
                out.push(0);
                out
            }
        }
    }

    /// Decode from wire bytes according to `ty`.
    ///
    /// For fixed-width types `data` must hold at least the wire size; extra
    /// trailing bytes are ignored. For STRING the trailing NUL is stripped
    /// (absent terminators consume the whole buffer).
    pub fn decode(data: &[u8], ty: ParamType) -> Result<ParamValue> {
        fn take<const N: usize>(data: &[u8], ty: ParamType) -> Result<[u8; N]> {
            data.get(..N)
                .and_then(|s| <[u8; N]>::try_from(s).ok())
                .ok_or_else(|| {
                    GatewayError::DataSizeError(format!(
                        "insufficient data for {}: {} bytes",
                        ty.type_name(),
                        data.len()
                    ))
                })
        }

        Ok(match ty {
            ParamType::Int8 => ParamValue::Int8(i8::from_le_bytes(take::<1>(data, ty)?)),
            ParamType::Int16 => ParamValue::Int16(i16::from_le_bytes(take::<2>(data, ty)?)),
            ParamType::Int32 => ParamValue::Int32(i32::from_le_bytes(take::<4>(data, ty)?)),
            ParamType::Int64 => ParamValue::Int64(i64::from_le_bytes(take::<8>(data, ty)?)),
            ParamType::UInt8 => ParamValue::UInt8(u8::from_le_bytes(take::<1>(data, ty)?)),
            ParamType::UInt16 => ParamValue::UInt16(u16::from_le_bytes(take::<2>(data, ty)?)),
            ParamType::UInt32 => ParamValue::UInt32(u32::from_le_bytes(take::<4>(data, ty)?)),
            ParamType::UInt64 => ParamValue::UInt64(u64::from_le_bytes(take::<8>(data, ty)?)),
            ParamType::Float => ParamValue::Float(f32::from_le_bytes(take::<4>(data, ty)?)),
            ParamType::Double => ParamValue::Double(f64::from_le_bytes(take::<8>(data, ty)?)),
            ParamType::Bool => ParamValue::Bool(take::<1>(data, ty)?[0] != 0),
            ParamType::String => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                ParamValue::Text(String::from_utf8_lossy(&data[..end]).into_owned())
            }
        })
    }

    /// Numeric view for range checks; `None` for BOOL and STRING.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int8(v) => Some(f64::from(*v)),
            ParamValue::Int16(v) => Some(f64::from(*v)),
            ParamValue::Int32(v) => Some(f64::from(*v)),
            ParamValue::Int64(v) => Some(*v as f64),
            ParamValue::UInt8(v) => Some(f64::from(*v)),
            ParamValue::UInt16(v) => Some(f64::from(*v)),
            ParamValue::UInt32(v) => Some(f64::from(*v)),
            ParamValue::UInt64(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(f64::from(*v)),
            ParamValue::Double(v) => Some(*v),
            ParamValue::Bool(_) | ParamValue::Text(_) => None,
        }
    }

    /// Coerce a JSON value to `ty`, rejecting anything lossy.
    ///
    /// Integer targets only accept integral JSON numbers that fit the
    /// target's range; a float with a fractional part is never silently
    /// truncated. BOOL accepts only booleans, STRING only strings.
    pub fn from_json(value: &serde_json::Value, ty: ParamType) -> Result<ParamValue> {
        use serde_json::Value;

        fn bad(ty: ParamType, value: &Value) -> GatewayError {
            GatewayError::BadValueType(format!("cannot coerce {value} to {}", ty.type_name()))
        }

        fn as_integer(value: &Value) -> Option<i128> {
            match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(i128::from(i))
                    } else if let Some(u) = n.as_u64() {
                        Some(i128::from(u))
                    } else {
                        // Accept floats with no fractional part (e.g. 47.0).
                        let f = n.as_f64()?;
                        (f.fract() == 0.0 && f.abs() < 2f64.powi(63)).then_some(f as i128)
                    }
                }
                _ => None,
            }
        }

        macro_rules! int_target {
            ($variant:ident, $t:ty) => {
                as_integer(value)
                    .and_then(|i| <$t>::try_from(i).ok())
                    .map(ParamValue::$variant)
                    .ok_or_else(|| bad(ty, value))
            };
        }

        match ty {
            ParamType::Int8 => int_target!(Int8, i8),
            ParamType::Int16 => int_target!(Int16, i16),
            ParamType::Int32 => int_target!(Int32, i32),
            ParamType::Int64 => int_target!(Int64, i64),
            ParamType::UInt8 => int_target!(UInt8, u8),
            ParamType::UInt16 => int_target!(UInt16, u16),
            ParamType::UInt32 => int_target!(UInt32, u32),
            ParamType::UInt64 => int_target!(UInt64, u64),
            ParamType::Float => value
                .as_f64()
                .map(|f| ParamValue::Float(f as f32))
                .ok_or_else(|| bad(ty, value)),
            ParamType::Double => value
                .as_f64()
                .map(ParamValue::Double)
                .ok_or_else(|| bad(ty, value)),
            ParamType::Bool => value
                .as_bool()
                .map(ParamValue::Bool)
                .ok_or_else(|| bad(ty, value)),
            ParamType::String => value
                .as_str()
                .map(|s| ParamValue::Text(s.to_string()))
                .ok_or_else(|| bad(ty, value)),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int8(v) => write!(f, "{v}"),
            ParamValue::Int16(v) => write!(f, "{v}"),
            ParamValue::Int32(v) => write!(f, "{v}"),
            ParamValue::Int64(v) => write!(f, "{v}"),
            ParamValue::UInt8(v) => write!(f, "{v}"),
            ParamValue::UInt16(v) => write!(f, "{v}"),
            ParamValue::UInt32(v) => write!(f, "{v}"),
            ParamValue::UInt64(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Double(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}
