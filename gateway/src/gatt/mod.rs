//! Read/write/notify primitives with type coercion.
//!
//! Grounded on `BLE_convert`: the Python original dispatches a raw
//! characteristic value through one of a handful of type converters
//! selected by a caller-declared type tag. The function itself was never
//! defined in the kept original source, so this module implements the
//! declared contract directly rather than guessing at a transliteration.
//!
//! [`ValueType`] fixes the numeric type codes used on the wire (`gatt`/
//! `gatt_result` `type` fields): `0=raw, 1=int, 2=float, 3=string, 4=uuid,
//! 5=bytes`.

use crate::device::{Channel, Device};
use crate::{Error, ErrorKind, Result, UuidExt, Uuid};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;

pub mod ops;

/// The declared type of a GATT value, used to coerce raw bytes on read and
/// to encode a JSON value to bytes on write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ValueType {
    /// Undecoded bytes, represented on the wire as a lowercase hex string.
    Raw = 0,
    /// A little-endian integer of natural width (1, 2, or 4 bytes).
    Int = 1,
    /// An IEEE-754 single-precision float, little-endian.
    Float = 2,
    /// A UTF-8 string.
    Str = 3,
    /// A 128-bit UUID, formatted `8-4-4-4-12`.
    Uuid = 4,
    /// Raw bytes, represented on the wire as a JSON array of integers.
    Bytes = 5,
}

impl ValueType {
    /// Parses a wire-format numeric type code.
    pub fn from_code(code: u8) -> Result<Self> {
        Self::from_u8(code).ok_or_else(|| Error::with_message(ErrorKind::DecodeError, format!("unknown value type code {code}")))
    }

    /// The wire-format numeric type code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Decodes `raw` according to `value_type`, producing the JSON
/// representation published on `gatt_result`.
///
/// `int` coerces based on the payload's actual length (1, 2, or 4 bytes;
/// anything else is a decode error), `float` requires exactly 4 bytes,
/// `string`/`uuid` are UTF-8 passthrough (the original left the UUID-type
/// branch undefined; treated here as equivalent to `string`), `raw` is a
/// hex string, and `bytes` is the untouched byte array.
pub fn decode_value(value_type: ValueType, raw: &[u8]) -> Result<serde_json::Value> {
    match value_type {
        ValueType::Raw => Ok(serde_json::Value::String(hex::encode(raw))),
        ValueType::Int => {
            let n: i64 = match raw.len() {
                1 => raw[0] as i64,
                2 => u16::from_le_bytes([raw[0], raw[1]]) as i64,
                4 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
                _ => return Err(Error::with_message(ErrorKind::DecodeError, format!("{}-byte value is not a natural int width", raw.len()))),
            };
            Ok(serde_json::Value::Number(n.into()))
        }
        ValueType::Float => {
            if raw.len() != 4 {
                return Err(Error::with_message(ErrorKind::DecodeError, "float value must be exactly 4 bytes"));
            }
            let f = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let n = serde_json::Number::from_f64(f as f64).ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            Ok(serde_json::Value::Number(n))
        }
        ValueType::Str | ValueType::Uuid => {
            let s = std::str::from_utf8(raw).map_err(|_| Error::new(ErrorKind::DecodeError))?;
            Ok(serde_json::Value::String(s.to_string()))
        }
        ValueType::Bytes => Ok(serde_json::Value::Array(raw.iter().map(|b| serde_json::Value::from(*b)).collect())),
    }
}

/// Encodes a JSON value to raw bytes for a write, according to `value_type`.
///
/// For `int`, the smallest natural width that represents the value is
/// chosen (1 byte for `0..=255`, 2 for `0..=65535`, else 4), little-endian.
/// The original left the write-side width unspecified: reads infer width
/// from the payload length, but a write has no payload yet to measure.
pub fn encode_value(value_type: ValueType, value: &serde_json::Value) -> Result<Vec<u8>> {
    match value_type {
        ValueType::Raw => {
            let s = value.as_str().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            hex::decode(s).map_err(|_| Error::new(ErrorKind::DecodeError))
        }
        ValueType::Int => {
            let n = value.as_i64().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            if (0..=u8::MAX as i64).contains(&n) {
                Ok(vec![n as u8])
            } else if (0..=u16::MAX as i64).contains(&n) {
                Ok((n as u16).to_le_bytes().to_vec())
            } else if (0..=u32::MAX as i64).contains(&n) {
                Ok((n as u32).to_le_bytes().to_vec())
            } else {
                Err(Error::with_message(ErrorKind::DecodeError, "integer out of range for a 4-byte write"))
            }
        }
        ValueType::Float => {
            let f = value.as_f64().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            Ok((f as f32).to_le_bytes().to_vec())
        }
        ValueType::Str | ValueType::Uuid => {
            let s = value.as_str().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            Ok(s.as_bytes().to_vec())
        }
        ValueType::Bytes => {
            let arr = value.as_array().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
            arr.iter().map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(|| Error::new(ErrorKind::DecodeError))).collect()
        }
    }
}

/// The 16-bit Client Characteristic Configuration descriptor UUID.
pub const CCCD_UUID: u16 = 0x2902;

/// The two-byte CCCD value that enables notifications (bit 0 set).
pub const CCCD_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// The two-byte CCCD value that enables indications (bit 1 set).
pub const CCCD_ENABLE_INDICATE: [u8; 2] = [0x02, 0x00];

/// Resolves a characteristic reference (a 16-bit hex string, e.g. `"2a19"`,
/// or a full 128-bit UUID string) against a discovered device, optionally
/// scoped to one service.
pub fn resolve_characteristic<'d>(device: &'d Device, service: Option<&str>, characteristic: &str) -> Result<&'d Channel> {
    let char_uuid = parse_uuid_ref(characteristic)?;
    let service_uuid = service.map(parse_uuid_ref).transpose()?;
    device
        .channel_by_uuid(service_uuid, char_uuid)
        .ok_or_else(|| Error::with_message(ErrorKind::NotFound, characteristic.to_string()))
}

fn parse_uuid_ref(s: &str) -> Result<Uuid> {
    if let Ok(short) = u16::from_str_radix(s, 16) {
        if s.len() <= 4 {
            return Ok(Uuid::from_u16(short));
        }
    }
    Uuid::parse_str(s).map_err(|_| Error::with_message(ErrorKind::InvalidAddress(s.to_string()), "not a valid characteristic UUID"))
}

/// Read/write/notify operations against a connected [`crate::adapter_trait::Peripheral`],
/// with type coercion and GATT-contract error mapping applied at the
/// boundary (§4.7, §7).
///
/// `GattOps` holds no state of its own: the caller supplies the device's
/// discovered handle table and the open peripheral for every call, which
/// keeps this module independent of how the session (connect/discover/
/// disconnect lifecycle, transaction serialization) is driven.
pub struct GattOps;

impl GattOps {
    /// Reads one characteristic and coerces it to its declared [`ValueType`].
    pub async fn read(peripheral: &dyn crate::Peripheral, channel: &Channel) -> Result<serde_json::Value> {
        let raw = peripheral.read(channel.handle).await.map_err(|e| tag_transport_error(e))?;
        decode_value(channel.value_type, &raw)
    }

    /// Encodes `value` to `channel`'s declared type and writes it.
    pub async fn write(peripheral: &dyn crate::Peripheral, channel: &Channel, value: &serde_json::Value) -> Result<()> {
        let raw = encode_value(channel.value_type, value)?;
        peripheral.write(channel.handle, &raw).await.map_err(|e| tag_transport_error(e))
    }

    /// Enables notifications on `channel` by writing its CCCD, if it has one.
    ///
    /// Normalizes the original's inconsistent descriptor-write boolean
    /// polarity: this always returns an explicit
    /// `Ok(())` on success or `Err` on failure, never a bare boolean.
    pub async fn allow_notifications(peripheral: &dyn crate::Peripheral, channel: &Channel) -> Result<()> {
        let cccd = channel.cccd_handle.ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        peripheral.write(cccd, &CCCD_ENABLE_NOTIFY).await.map_err(|e| tag_transport_error(e))
    }
}

fn tag_transport_error(err: Error) -> Error {
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_decodes_by_payload_width() {
        assert_eq!(decode_value(ValueType::Int, &[0x2a]).unwrap(), serde_json::json!(0x2a));
        assert_eq!(decode_value(ValueType::Int, &[0x34, 0x12]).unwrap(), serde_json::json!(0x1234));
        assert_eq!(decode_value(ValueType::Int, &[0x78, 0x56, 0x34, 0x12]).unwrap(), serde_json::json!(0x1234_5678u32));
    }

    #[test]
    fn int_rejects_non_natural_widths() {
        assert!(decode_value(ValueType::Int, &[1, 2, 3]).is_err());
    }

    #[test]
    fn float_round_trips_through_encode_and_decode() {
        let raw = encode_value(ValueType::Float, &serde_json::json!(46.6)).unwrap();
        let decoded = decode_value(ValueType::Float, &raw).unwrap();
        let f = decoded.as_f64().unwrap();
        assert!((f - 46.6).abs() < 1e-3);
    }

    #[test]
    fn int_encode_identity_holds_for_same_magnitude_values() {
        for n in [0i64, 255, 256, 65535, 65536, 16_777_216] {
            let raw = encode_value(ValueType::Int, &serde_json::json!(n)).unwrap();
            let decoded = decode_value(ValueType::Int, &raw).unwrap();
            assert_eq!(decoded, serde_json::json!(n));
        }
    }

    #[test]
    fn raw_encodes_and_decodes_as_hex() {
        let raw = encode_value(ValueType::Raw, &serde_json::json!("0a1b")).unwrap();
        assert_eq!(raw, vec![0x0a, 0x1b]);
        assert_eq!(decode_value(ValueType::Raw, &raw).unwrap(), serde_json::json!("0a1b"));
    }

    #[test]
    fn bytes_round_trips_as_a_json_array() {
        let raw = encode_value(ValueType::Bytes, &serde_json::json!([1, 2, 3])).unwrap();
        assert_eq!(raw, vec![1, 2, 3]);
        assert_eq!(decode_value(ValueType::Bytes, &raw).unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn value_type_code_round_trips() {
        for code in 0..=5u8 {
            assert_eq!(ValueType::from_code(code).unwrap().code(), code);
        }
        assert!(ValueType::from_code(6).is_err());
    }
}
