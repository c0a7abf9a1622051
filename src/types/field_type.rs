//! Field type definitions and their byte codecs

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

use super::Value;

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Most significant byte first (`MSB_` prefix)
    Big,
    /// Least significant byte first (`LSB_` prefix)
    Little,
}

/// Supported field layouts.
///
/// Primitive types decode to a plain number. The three complex types carry
/// meaning beyond their bits and always get a converted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    U8,
    I8,
    U16(ByteOrder),
    I16(ByteOrder),
    U32(ByteOrder),
    I32(ByteOrder),
    U64(ByteOrder),
    I64(ByteOrder),
    F32(ByteOrder),
    F64(ByteOrder),
    /// GPS time: big-endian u32 seconds followed by a u32 binary fraction
    Time64,
    /// Big-endian u16 command opcode
    Cmd16,
    /// Big-endian u16 event-report code
    Evr16,
}

/// Start of GPS time, 1980-01-06T00:00:00Z. Leap seconds are not applied.
pub fn gps_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).single().unwrap_or(DateTime::UNIX_EPOCH)
}

macro_rules! ordered {
    ($order:expr, $ty:ty, $bytes:expr) => {
        match $order {
            ByteOrder::Big => <$ty>::from_be_bytes($bytes),
            ByteOrder::Little => <$ty>::from_le_bytes($bytes),
        }
    };
}

fn array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.get(..N)?.try_into().ok()
}

fn push_ordered<const N: usize>(out: &mut Vec<u8>, order: ByteOrder, be: [u8; N], le: [u8; N]) {
    match order {
        ByteOrder::Big => out.extend_from_slice(&be),
        ByteOrder::Little => out.extend_from_slice(&le),
    }
}

impl FieldType {
    /// Returns the size in bytes of this field type.
    pub const fn size(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16(_) | FieldType::I16(_) | FieldType::Cmd16 | FieldType::Evr16 => 2,
            FieldType::U32(_) | FieldType::I32(_) | FieldType::F32(_) => 4,
            FieldType::U64(_) | FieldType::I64(_) | FieldType::F64(_) | FieldType::Time64 => 8,
        }
    }

    /// Whether the type is structured rather than a plain number.
    pub const fn is_complex(&self) -> bool {
        matches!(self, FieldType::Time64 | FieldType::Cmd16 | FieldType::Evr16)
    }

    /// Text substituted when a reference value cannot be resolved.
    pub const fn unidentified_label(&self) -> Option<&'static str> {
        match self {
            FieldType::Cmd16 => Some("Unidentified Cmd"),
            FieldType::Evr16 => Some("Unidentified EVR"),
            _ => None,
        }
    }

    /// Decode a raw value from the start of `bytes`.
    ///
    /// Returns `None` when fewer than [`FieldType::size`] bytes are available.
    pub fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let value = match *self {
            FieldType::U8 => Value::UInt(u64::from(array::<1>(bytes)?[0])),
            FieldType::I8 => Value::Int(i64::from(array::<1>(bytes)?[0] as i8)),
            FieldType::U16(o) => Value::UInt(u64::from(ordered!(o, u16, array(bytes)?))),
            FieldType::I16(o) => Value::Int(i64::from(ordered!(o, i16, array(bytes)?))),
            FieldType::U32(o) => Value::UInt(u64::from(ordered!(o, u32, array(bytes)?))),
            FieldType::I32(o) => Value::Int(i64::from(ordered!(o, i32, array(bytes)?))),
            FieldType::U64(o) => Value::UInt(ordered!(o, u64, array(bytes)?)),
            FieldType::I64(o) => Value::Int(ordered!(o, i64, array(bytes)?)),
            FieldType::F32(o) => Value::Float(f64::from(ordered!(o, f32, array(bytes)?))),
            FieldType::F64(o) => Value::Float(ordered!(o, f64, array(bytes)?)),
            FieldType::Time64 => {
                let seconds = u32::from_be_bytes(array(bytes)?);
                let fraction = u32::from_be_bytes(array(bytes.get(4..)?)?);
                Value::Float(f64::from(seconds) + f64::from(fraction) / 4_294_967_296.0)
            }
            FieldType::Cmd16 | FieldType::Evr16 => {
                Value::UInt(u64::from(u16::from_be_bytes(array(bytes)?)))
            }
        };
        Some(value)
    }

    /// Append the encoding of `value` to `out`.
    ///
    /// Fails when the value is not numeric or does not fit the type.
    pub(crate) fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), String> {
        let out_of_range = || format!("{value} does not fit {self}");
        let int = || value.as_i128().ok_or_else(out_of_range);

        match *self {
            FieldType::U8 => out.push(u8::try_from(int()?).map_err(|_| out_of_range())?),
            FieldType::I8 => out.push(i8::try_from(int()?).map_err(|_| out_of_range())? as u8),
            FieldType::U16(o) => {
                let v = u16::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::I16(o) => {
                let v = i16::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::U32(o) => {
                let v = u32::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::I32(o) => {
                let v = i32::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::U64(o) => {
                let v = u64::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::I64(o) => {
                let v = i64::try_from(int()?).map_err(|_| out_of_range())?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::F32(o) => {
                let v = value.as_f64().ok_or_else(out_of_range)? as f32;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::F64(o) => {
                let v = value.as_f64().ok_or_else(out_of_range)?;
                push_ordered(out, o, v.to_be_bytes(), v.to_le_bytes());
            }
            FieldType::Time64 => {
                let seconds = match value {
                    Value::Time(t) => {
                        let elapsed = *t - gps_epoch();
                        elapsed.num_microseconds().ok_or_else(out_of_range)? as f64 / 1e6
                    }
                    other => other.as_f64().ok_or_else(out_of_range)?,
                };
                if !(0.0..4_294_967_296.0).contains(&seconds) {
                    return Err(out_of_range());
                }
                let whole = seconds.trunc();
                let fraction = ((seconds - whole) * 4_294_967_296.0).round().min(u32::MAX as f64);
                out.extend_from_slice(&(whole as u32).to_be_bytes());
                out.extend_from_slice(&(fraction as u32).to_be_bytes());
            }
            FieldType::Cmd16 | FieldType::Evr16 => {
                let v = u16::try_from(int()?).map_err(|_| out_of_range())?;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Convert a decoded Time64 raw value into a date-time.
    pub fn gps_time(seconds: f64) -> Option<DateTime<Utc>> {
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        let micros = (seconds * 1e6).round() as i64;
        gps_epoch().checked_add_signed(Duration::microseconds(micros))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (order, base) = match self {
            FieldType::U8 => return f.write_str("U8"),
            FieldType::I8 => return f.write_str("I8"),
            FieldType::Time64 => return f.write_str("TIME64"),
            FieldType::Cmd16 => return f.write_str("CMD16"),
            FieldType::Evr16 => return f.write_str("EVR16"),
            FieldType::U16(o) => (o, "U16"),
            FieldType::I16(o) => (o, "I16"),
            FieldType::U32(o) => (o, "U32"),
            FieldType::I32(o) => (o, "I32"),
            FieldType::U64(o) => (o, "U64"),
            FieldType::I64(o) => (o, "I64"),
            FieldType::F32(o) => (o, "F32"),
            FieldType::F64(o) => (o, "F64"),
        };
        match order {
            ByteOrder::Big => write!(f, "MSB_{base}"),
            ByteOrder::Little => write!(f, "LSB_{base}"),
        }
    }
}

impl FromStr for FieldType {
    type Err = crate::TelemuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let simple = match s {
            "U8" => Some(FieldType::U8),
            "I8" => Some(FieldType::I8),
            "TIME64" => Some(FieldType::Time64),
            "CMD16" => Some(FieldType::Cmd16),
            "EVR16" => Some(FieldType::Evr16),
            _ => None,
        };
        if let Some(field_type) = simple {
            return Ok(field_type);
        }

        let (order, base) = if let Some(base) = s.strip_prefix("MSB_") {
            (ByteOrder::Big, base)
        } else if let Some(base) = s.strip_prefix("LSB_") {
            (ByteOrder::Little, base)
        } else {
            return Err(crate::TelemuxError::invalid_definition("field type", format!("unknown type '{s}'")));
        };

        match base {
            "U16" => Ok(FieldType::U16(order)),
            "I16" => Ok(FieldType::I16(order)),
            "U32" => Ok(FieldType::U32(order)),
            "I32" => Ok(FieldType::I32(order)),
            "U64" => Ok(FieldType::U64(order)),
            "I64" => Ok(FieldType::I64(order)),
            "F32" => Ok(FieldType::F32(order)),
            "F64" => Ok(FieldType::F64(order)),
            _ => Err(crate::TelemuxError::invalid_definition("field type", format!("unknown type '{s}'"))),
        }
    }
}
