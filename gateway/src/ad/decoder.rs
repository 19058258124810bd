//! GATT Assigned-Number service-data decoders, plus the pluggable registry
//! vendor decoders attach to.
//!
//! Grounded on `BLE_Data.BLE_DataService` in the Python original: a static
//! table mapping a 16-bit UUID to a name and a decode function. `0x2A19`
//! (battery level) and `0x2A6E` (temperature) are the two the original
//! ships; the rest are added here as the same kind of table entry.

use crate::{Error, ErrorKind, Result};
use std::collections::HashMap;

/// A decoded characteristic or service-data value.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    /// A signed integer of any width up to 64 bits.
    Int(i64),
    /// An IEEE-754 value.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// Raw bytes, left undecoded.
    Bytes(Vec<u8>),
    /// A small named tuple (e.g. 3-axis acceleration), for values that don't
    /// reduce to a single scalar.
    Composite(Vec<(&'static str, DecodedValue)>),
}

/// A pure decode function from a raw service-data/characteristic payload to
/// a [`DecodedValue`].
pub type PayloadDecoder = fn(&[u8]) -> Result<DecodedValue>;

/// Maps a 16-bit service/characteristic UUID, or a vendor manufacturer ID,
/// to the decoder that understands its payload.
///
/// Built with the built-in GATT Assigned Number decoders registered;
/// additional vendor decoders (e.g. Ruuvi) are registered by the caller at
/// startup via [`PayloadDecoderRegistry::register_service`] /
/// [`PayloadDecoderRegistry::register_manufacturer`]. The registry is meant
/// to be built once and treated as read-only afterwards; it has no internal
/// locking.
pub struct PayloadDecoderRegistry {
    by_service_uuid: HashMap<u16, (&'static str, PayloadDecoder)>,
    by_manufacturer_id: HashMap<u16, (&'static str, PayloadDecoder)>,
}

impl Default for PayloadDecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadDecoderRegistry {
    /// Builds a registry pre-populated with the built-in GATT decoders.
    pub fn new() -> Self {
        let mut registry = Self { by_service_uuid: HashMap::new(), by_manufacturer_id: HashMap::new() };
        registry.register_service(0x2A19, "battery_level", decode_battery_level);
        registry.register_service(0x180F, "battery_level", decode_battery_level);
        registry.register_service(0x2A6E, "temperature", decode_temperature);
        registry.register_service(0x2A6F, "humidity", decode_humidity);
        registry.register_service(0x2A06, "alert_level", decode_alert_level);
        registry.register_service(0x2A3F, "alert_status", decode_alert_status);
        registry.register_service(0x2AA1, "magnetic_flux_density_3d", decode_magnetic_flux_density_3d);
        registry.register_service(0x2A58, "analog", decode_analog);
        registry.register_service(super::parser::EDDYSTONE_SERVICE_UUID, "eddystone", decode_passthrough);
        registry
    }

    /// Registers (or replaces) the decoder for a 16-bit service UUID.
    pub fn register_service(&mut self, uuid: u16, name: &'static str, decoder: PayloadDecoder) {
        self.by_service_uuid.insert(uuid, (name, decoder));
    }

    /// Registers (or replaces) a vendor decoder keyed by manufacturer ID,
    /// applied to the manufacturer-specific-data payload (ID bytes excluded).
    pub fn register_manufacturer(&mut self, manufacturer_id: u16, name: &'static str, decoder: PayloadDecoder) {
        self.by_manufacturer_id.insert(manufacturer_id, (name, decoder));
    }

    /// Looks up and runs the decoder registered for `uuid`, if any.
    pub fn decode_service(&self, uuid: u16, payload: &[u8]) -> Option<(&'static str, Result<DecodedValue>)> {
        self.by_service_uuid.get(&uuid).map(|(name, decoder)| (*name, decoder(payload)))
    }

    /// Looks up and runs the vendor decoder registered for `manufacturer_id`, if any.
    pub fn decode_manufacturer(&self, manufacturer_id: u16, payload: &[u8]) -> Option<(&'static str, Result<DecodedValue>)> {
        self.by_manufacturer_id.get(&manufacturer_id).map(|(name, decoder)| (*name, decoder(payload)))
    }
}

/// Eddystone service data is left undecoded here: `AdParser` already split
/// frame-type and body out into [`crate::ad::BeaconKind::Eddystone`] for
/// anyone who wants the structured view; the registry entry exists so
/// `0xFEAA` service data still shows up in a device's decoded `service_data`
/// map (as raw bytes) instead of being silently dropped for lack of a
/// decoder.
fn decode_passthrough(payload: &[u8]) -> Result<DecodedValue> {
    Ok(DecodedValue::Bytes(payload.to_vec()))
}

fn decode_battery_level(payload: &[u8]) -> Result<DecodedValue> {
    let byte = *payload.first().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
    Ok(DecodedValue::Int(byte as i64))
}

/// `0x2A6E`: signed 16-bit little-endian, hundredths of a degree Celsius.
fn decode_temperature(payload: &[u8]) -> Result<DecodedValue> {
    let raw = read_i16_le(payload)?;
    Ok(DecodedValue::Float(raw as f64 / 100.0))
}

/// `0x2A6F`: unsigned 8-bit, halves of a percent.
fn decode_humidity(payload: &[u8]) -> Result<DecodedValue> {
    let byte = *payload.first().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
    Ok(DecodedValue::Float(byte as f64 * 0.5))
}

fn decode_alert_level(payload: &[u8]) -> Result<DecodedValue> {
    let byte = *payload.first().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
    Ok(DecodedValue::Composite(vec![
        ("active", DecodedValue::Int((byte & 0x01) as i64)),
        ("counter", DecodedValue::Int((byte >> 1) as i64)),
    ]))
}

fn decode_alert_status(payload: &[u8]) -> Result<DecodedValue> {
    let byte = *payload.first().ok_or_else(|| Error::new(ErrorKind::DecodeError))?;
    Ok(DecodedValue::Int(byte as i64))
}

/// `0x2AA1`: three signed 16-bit little-endian axes.
fn decode_magnetic_flux_density_3d(payload: &[u8]) -> Result<DecodedValue> {
    if payload.len() < 6 {
        return Err(Error::new(ErrorKind::DecodeError));
    }
    let x = i16::from_le_bytes([payload[0], payload[1]]);
    let y = i16::from_le_bytes([payload[2], payload[3]]);
    let z = i16::from_le_bytes([payload[4], payload[5]]);
    Ok(DecodedValue::Composite(vec![
        ("x", DecodedValue::Int(x as i64)),
        ("y", DecodedValue::Int(y as i64)),
        ("z", DecodedValue::Int(z as i64)),
    ]))
}

fn decode_analog(payload: &[u8]) -> Result<DecodedValue> {
    if payload.len() < 2 {
        return Err(Error::new(ErrorKind::DecodeError));
    }
    Ok(DecodedValue::Int(u16::from_le_bytes([payload[0], payload[1]]) as i64))
}

fn read_i16_le(payload: &[u8]) -> Result<i16> {
    if payload.len() < 2 {
        return Err(Error::new(ErrorKind::DecodeError));
    }
    Ok(i16::from_le_bytes([payload[0], payload[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_decodes_with_two_decimal_precision() {
        let registry = PayloadDecoderRegistry::new();
        let (name, value) = registry.decode_service(0x2A6E, &[0x34, 0x12]).unwrap();
        assert_eq!(name, "temperature");
        match value.unwrap() {
            DecodedValue::Float(celsius) => assert!((celsius - 46.60).abs() < 1e-9),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn battery_level_decodes_as_raw_byte() {
        let registry = PayloadDecoderRegistry::new();
        let (name, value) = registry.decode_service(0x2A19, &[0x55]).unwrap();
        assert_eq!(name, "battery_level");
        assert_eq!(value.unwrap(), DecodedValue::Int(0x55));
    }

    #[test]
    fn unknown_uuid_has_no_decoder() {
        let registry = PayloadDecoderRegistry::new();
        assert!(registry.decode_service(0xBEEF, &[]).is_none());
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let registry = PayloadDecoderRegistry::new();
        let (_, value) = registry.decode_service(0x2A6E, &[0x34]).unwrap();
        assert!(value.is_err());
    }

    #[test]
    fn vendor_decoder_can_be_registered_by_manufacturer_id() {
        let mut registry = PayloadDecoderRegistry::new();
        registry.register_manufacturer(0x0499, "ruuvi_raw", |_payload| Ok(DecodedValue::Str("stub".into())));
        let (name, value) = registry.decode_manufacturer(0x0499, &[]).unwrap();
        assert_eq!(name, "ruuvi_raw");
        assert_eq!(value.unwrap(), DecodedValue::Str("stub".into()));
    }
}
