//! Advertisement TLV decoding: Flags, Service UUIDs, Local Name, Service Data
//! and Manufacturer Data, plus Eddystone and iBeacon beacon-kind detection.

use crate::{Error, ErrorKind, Result};
use std::collections::HashMap;
use uuid::Uuid;

/// Common Bluetooth AD structure type values.
///
/// See the GAP assigned-numbers document for the complete list; only the
/// types this gateway interprets are named here.
pub mod data_type {
    /// Flags: BR/EDR and LE mode bits.
    pub const FLAGS: u8 = 0x01;
    /// Complete List of 16-bit Service Class UUIDs.
    pub const COMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS: u8 = 0x03;
    /// Complete Local Name.
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    /// Service Data, 16-bit UUID.
    pub const SERVICE_DATA_16_BIT: u8 = 0x16;
    /// Manufacturer Specific Data.
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

pub(crate) const EDDYSTONE_SERVICE_UUID: u16 = 0xFEAA;
const APPLE_MANUFACTURER_ID: u16 = 0x004C;

/// A single `(type, value)` advertisement structure, as transmitted over the
/// air (before any higher-level decoding).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdStructure {
    /// The AD structure's type byte (see [`data_type`]).
    pub ad_type: u8,
    /// The structure's value, excluding the length and type bytes.
    pub value: Vec<u8>,
}

/// The full set of AD structures observed for one advertisement report.
///
/// This is the shape [`crate::bluez`] synthesizes from BlueZ's already
/// demultiplexed `org.bluez.Device1` properties, and the shape a test can
/// construct directly from a raw byte capture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Structures observed in this report, in transmission order.
    pub structures: Vec<AdStructure>,
}

impl RawAdvertisement {
    /// Parses a raw over-the-air AD structure byte stream
    /// (`len, type, value, len, type, value, ...`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut structures = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let len = bytes[i] as usize;
            if len == 0 {
                break;
            }
            if i + 1 + len > bytes.len() {
                return Err(Error::new(ErrorKind::BadAdvertisement));
            }
            let ad_type = bytes[i + 1];
            let value = bytes[i + 2..i + 1 + len].to_vec();
            structures.push(AdStructure { ad_type, value });
            i += 1 + len;
        }
        Ok(Self { structures })
    }
}

/// Beacon framing recognized within a [`RawAdvertisement`], when present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeaconKind {
    /// No recognized beacon framing; a plain GATT-style advertisement.
    Standard,
    /// A Google Eddystone frame.
    Eddystone(EddystoneFrame),
    /// An Apple iBeacon frame.
    IBeacon(IBeaconFrame),
}

/// Decoded Eddystone service-data frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EddystoneFrame {
    /// Frame type byte: `0x00` UID, `0x10` URL, `0x20` TLM.
    pub frame_type: u8,
    /// Remaining frame bytes, undecoded (URL/UID/TLM specific layout).
    pub body: Vec<u8>,
}

/// Decoded Apple iBeacon frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IBeaconFrame {
    /// Proximity UUID, formatted as transmitted (big-endian byte order).
    pub uuid: Uuid,
    /// Major value.
    pub major: u16,
    /// Minor value.
    pub minor: u16,
    /// Measured power at 1 meter, in dBm (signed).
    pub measured_power: i8,
}

/// A fully parsed advertisement record, ready for filtering and publishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisementRecord {
    /// Local name, if a Complete Local Name structure was present.
    pub local_name: Option<String>,
    /// Flags byte, if a Flags structure was present.
    pub flags: Option<u8>,
    /// 16-bit service UUIDs advertised as a service-class list.
    pub service_uuids: Vec<u16>,
    /// Service Data structures, keyed by 16-bit service UUID.
    pub service_data: HashMap<u16, Vec<u8>>,
    /// Manufacturer ID, if Manufacturer Specific Data was present.
    pub manufacturer_id: Option<u16>,
    /// Manufacturer payload bytes (excluding the 2-byte ID), if present.
    pub manufacturer_data: Vec<u8>,
    /// Recognized beacon framing.
    pub kind: BeaconKind,
}

/// Stateless decoder from [`RawAdvertisement`] to [`AdvertisementRecord`].
///
/// Grounded on `BLE_Device_Delegate.handleDiscovery`/`BLE_Device.from_scan_data`
/// in the Python original: flags, name, service UUIDs, service data and
/// manufacturer data are each pulled from their AD structure when present,
/// and Eddystone/iBeacon framing is detected from the same two structures
/// GATT service data and manufacturer data already decode.
pub struct AdParser;

impl AdParser {
    /// Parses a raw advertisement into a structured record.
    ///
    /// A TLV with an inconsistent length is rejected with
    /// [`ErrorKind::BadAdvertisement`]; callers should log and keep the
    /// device's previous record rather than discard the device entirely.
    pub fn parse(raw: &RawAdvertisement) -> Result<AdvertisementRecord> {
        let mut record = AdvertisementRecord {
            local_name: None,
            flags: None,
            service_uuids: Vec::new(),
            service_data: HashMap::new(),
            manufacturer_id: None,
            manufacturer_data: Vec::new(),
            kind: BeaconKind::Standard,
        };

        for s in &raw.structures {
            match s.ad_type {
                data_type::FLAGS => {
                    record.flags = s.value.first().copied();
                }
                data_type::COMPLETE_LOCAL_NAME => {
                    record.local_name = Some(String::from_utf8_lossy(&s.value).into_owned());
                }
                data_type::COMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS => {
                    for chunk in s.value.chunks_exact(2) {
                        let uuid16 = u16::from_le_bytes([chunk[0], chunk[1]]);
                        record.service_uuids.push(uuid16);
                        if uuid16 == EDDYSTONE_SERVICE_UUID {
                            record.kind = BeaconKind::Eddystone(EddystoneFrame { frame_type: 0, body: Vec::new() });
                        }
                    }
                }
                data_type::SERVICE_DATA_16_BIT => {
                    if s.value.len() < 2 {
                        return Err(Error::new(ErrorKind::BadAdvertisement));
                    }
                    let uuid16 = u16::from_le_bytes([s.value[0], s.value[1]]);
                    let payload = s.value[2..].to_vec();
                    if uuid16 == EDDYSTONE_SERVICE_UUID {
                        let frame_type = payload.first().copied().unwrap_or_default();
                        let body = payload.get(1..).map(|b| b.to_vec()).unwrap_or_default();
                        record.kind = BeaconKind::Eddystone(EddystoneFrame { frame_type, body });
                    }
                    record.service_data.insert(uuid16, payload);
                }
                data_type::MANUFACTURER_SPECIFIC_DATA => {
                    if s.value.len() < 2 {
                        return Err(Error::new(ErrorKind::BadAdvertisement));
                    }
                    let mfg_id = u16::from_le_bytes([s.value[0], s.value[1]]);
                    let payload = s.value[2..].to_vec();
                    if mfg_id == APPLE_MANUFACTURER_ID {
                        if let Some(frame) = parse_ibeacon(&payload) {
                            record.kind = BeaconKind::IBeacon(frame);
                        }
                    }
                    record.manufacturer_id = Some(mfg_id);
                    record.manufacturer_data = payload;
                }
                _ => {}
            }
        }

        Ok(record)
    }
}

/// Recognizes the Apple iBeacon `02 15 <uuid:16> <major:2> <minor:2> <power:1>`
/// sub-structure within manufacturer-specific data for ID `0x004C`.
fn parse_ibeacon(payload: &[u8]) -> Option<IBeaconFrame> {
    if payload.len() < 23 || payload[0] != 0x02 || payload[1] != 0x15 {
        return None;
    }
    let uuid_bytes: [u8; 16] = payload[2..18].try_into().ok()?;
    let major = u16::from_be_bytes([payload[18], payload[19]]);
    let minor = u16::from_be_bytes([payload[20], payload[21]]);
    let measured_power = payload[22] as i8;
    Some(IBeaconFrame { uuid: Uuid::from_bytes(uuid_bytes), major, minor, measured_power })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_eddystone_service_uuid_are_decoded() {
        let raw = RawAdvertisement::from_bytes(&[0x02, 0x01, 0x06, 0x03, 0x03, 0xAA, 0xFE]).unwrap();
        let record = AdParser::parse(&raw).unwrap();
        assert_eq!(record.flags, Some(0x06));
        assert_eq!(record.service_uuids, vec![0xFEAA]);
        assert!(matches!(record.kind, BeaconKind::Eddystone(_)));
    }

    #[test]
    fn ibeacon_manufacturer_data_is_decoded() {
        let mut value = vec![0x4C, 0x00, 0x02, 0x15];
        value.extend_from_slice(&[0xAA; 16]);
        value.extend_from_slice(&[0x00, 0x01]); // major = 1
        value.extend_from_slice(&[0x00, 0x02]); // minor = 2
        value.push(0xC5); // -59 dBm
        let raw = RawAdvertisement { structures: vec![AdStructure { ad_type: 0xFF, value }] };
        let record = AdParser::parse(&raw).unwrap();
        match record.kind {
            BeaconKind::IBeacon(frame) => {
                assert_eq!(frame.major, 1);
                assert_eq!(frame.minor, 2);
                assert_eq!(frame.measured_power, -59);
                assert_eq!(frame.uuid.to_string(), "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
            }
            other => panic!("expected ibeacon, got {other:?}"),
        }
    }

    #[test]
    fn temperature_service_data_round_trips_to_raw_payload() {
        let raw = RawAdvertisement {
            structures: vec![AdStructure { ad_type: 0x16, value: vec![0x6E, 0x2A, 0x34, 0x12] }],
        };
        let record = AdParser::parse(&raw).unwrap();
        assert_eq!(record.service_data.get(&0x2A6E), Some(&vec![0x34, 0x12]));
    }

    #[test]
    fn truncated_service_data_is_rejected() {
        let raw = RawAdvertisement { structures: vec![AdStructure { ad_type: 0x16, value: vec![0x6E] }] };
        assert!(AdParser::parse(&raw).is_err());
    }

    #[test]
    fn malformed_length_prefix_is_rejected() {
        assert!(RawAdvertisement::from_bytes(&[0x05, 0x01, 0x06]).is_err());
    }
}
