//! The device registry and per-device advertisement/connection state.
//!
//! Grounded on `BLE_Device`/`BLE_GATT_Service`/`Channel` in `BLE_Client.py`.
//! The original has `Device` and `Channel` hold mutable back-references to
//! each other (a `Channel` keeps a pointer to its owning `Device` so a
//! notification delegate can reach back into device state). Rust's
//! ownership rules make that cycle awkward, and it turns out to be
//! unnecessary here: a notification is always dispatched by characteristic
//! *handle*, so [`crate::session::SessionManager`] looks the owning
//! [`Channel`] up by handle in `Device::services` at delivery time instead
//! of storing a pointer to it. `Device` owns a flat `Vec<Service>`, each
//! owning its `Vec<Channel>` — a tree, not a cycle.

use crate::ad::{AdvertisementRecord, BeaconKind, DecodedValue, PayloadDecoderRegistry};
use crate::{Address, AddressType};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

/// A decoded GATT service-data value, combining the UUID it was advertised
/// under with the type the [`crate::ad::PayloadDecoderRegistry`] produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceDatum {
    /// 16-bit service UUID the data was advertised under.
    pub uuid: u16,
    /// Human-readable name of the decoded quantity, if a decoder matched.
    pub name: Option<&'static str>,
    /// Decoded value, or the raw bytes if no decoder was registered.
    pub value: DecodedValue,
}

/// A discovered GATT characteristic, scoped to its owning [`Service`].
#[derive(Clone, Debug)]
pub struct Channel {
    /// Characteristic UUID.
    pub uuid: uuid::Uuid,
    /// Handle used for read/write/notify calls against the adapter.
    pub handle: u16,
    /// Declared value type, used to coerce raw bytes on read/write.
    pub value_type: crate::gatt::ValueType,
    /// Whether the characteristic supports `read`.
    pub readable: bool,
    /// Whether the characteristic supports `write`.
    pub writable: bool,
    /// Whether the characteristic supports `notify`/`indicate`.
    pub notifiable: bool,
    /// Handle of the `0x2902` descriptor, when present.
    pub cccd_handle: Option<u16>,
}

/// A discovered GATT service, scoped to its owning [`Device`].
#[derive(Clone, Debug)]
pub struct Service {
    /// Service UUID.
    pub uuid: uuid::Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Characteristics belonging to this service.
    pub channels: Vec<Channel>,
}

/// A device's connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Seen in advertisements only; never connected, or fully torn down.
    Absent,
    /// Connected but services not yet discovered.
    Connected,
    /// Connected and services discovered; GATT operations are possible.
    Discovered,
    /// `disconnect` has been requested and is in flight.
    TearingDown,
}

/// One known device: advertisement-derived attributes plus connection state.
///
/// Invariants: `conn_state` is `Connected` or
/// `Discovered` only if `connectable` is true; `Discovered` implies
/// `services` is populated; `max_rssi` is monotone non-decreasing within a
/// scan cycle.
#[derive(Clone, Debug)]
pub struct Device {
    /// Device address.
    pub address: Address,
    /// Address type (public or random).
    pub address_type: AddressType,
    /// Local name, if advertised.
    pub local_name: Option<String>,
    /// Most recent RSSI observed, in dBm.
    pub last_rssi: Option<i16>,
    /// Running maximum RSSI within the current scan cycle.
    pub max_rssi: Option<i16>,
    /// Whether the last advertisement reported the device as connectable.
    pub connectable: bool,
    /// Low 8 bits of the advertising `Flags` AD structure, when present.
    pub flags: Option<u8>,
    /// Recognized beacon framing from the most recent advertisement.
    pub kind: BeaconKind,
    /// Decoded service-data values, keyed by 16-bit service UUID.
    pub service_data: HashMap<u16, ServiceDatum>,
    /// Manufacturer ID from the most recent advertisement.
    pub manufacturer_id: Option<u16>,
    /// Manufacturer payload bytes from the most recent advertisement.
    pub manufacturer_data: Vec<u8>,
    /// Name of the vendor decoder registered for `manufacturer_id`, if any
    /// matched (e.g. `"ruuvi"`).
    pub manufacturer_decoder: Option<&'static str>,
    /// Decoded manufacturer payload, when a vendor decoder registered under
    /// `manufacturer_id`'s namespace matched and succeeded.
    pub manufacturer_value: Option<DecodedValue>,
    /// Timestamp of the most recent advertisement.
    pub adv_timestamp: Instant,
    /// Timestamp of the most recent callback report (throttling state).
    pub last_report: Option<Instant>,
    /// Connection lifecycle state.
    pub conn_state: ConnState,
    /// Discovered services, populated once `conn_state == Discovered`.
    pub services: Vec<Service>,
}

impl Device {
    /// Builds a fresh device record from a first advertisement.
    pub fn from_scan_data(
        address: Address, address_type: AddressType, rssi: Option<i16>, connectable: bool, ad: &AdvertisementRecord, decoders: &PayloadDecoderRegistry,
    ) -> Self {
        let mut device = Self {
            address,
            address_type,
            local_name: None,
            last_rssi: rssi,
            max_rssi: rssi,
            connectable,
            flags: None,
            kind: BeaconKind::Standard,
            service_data: HashMap::new(),
            manufacturer_id: None,
            manufacturer_data: Vec::new(),
            manufacturer_decoder: None,
            manufacturer_value: None,
            adv_timestamp: Instant::now(),
            last_report: None,
            conn_state: ConnState::Absent,
            services: Vec::new(),
        };
        device.merge_advertisement(rssi, connectable, ad, decoders);
        device
    }

    /// Merges a new advertisement into this device's state in place.
    ///
    /// Grounded on `BLE_Device.updateDevice` in the Python original, which
    /// the original source calls via `self(entry)` (subscript-call
    /// syntax on an instance) rather than a named method — treated here
    /// as the equivalent of re-running `from_scan_data`
    /// against the existing record: every advertised field is overwritten
    /// except the running-max RSSI, which only ever increases. `decoders`
    /// runs each service-data payload through [`PayloadDecoderRegistry`] so
    /// `service_data` holds decoded values, not the raw bytes `ad` carries.
    pub fn merge_advertisement(&mut self, rssi: Option<i16>, connectable: bool, ad: &AdvertisementRecord, decoders: &PayloadDecoderRegistry) {
        if let Some(name) = &ad.local_name {
            self.local_name = Some(name.clone());
        }
        self.last_rssi = rssi;
        self.max_rssi = match (self.max_rssi, rssi) {
            (Some(prev), Some(new)) => Some(prev.max(new)),
            (None, new) => new,
            (prev, None) => prev,
        };
        self.connectable = connectable;
        if let Some(flags) = ad.flags {
            self.flags = Some(flags);
        }
        if !matches!(ad.kind, BeaconKind::Standard) {
            self.kind = ad.kind.clone();
        }
        if let Some(id) = ad.manufacturer_id {
            self.manufacturer_id = Some(id);
            self.manufacturer_data = ad.manufacturer_data.clone();
            match decoders.decode_manufacturer(id, &ad.manufacturer_data) {
                Some((name, Ok(value))) => {
                    self.manufacturer_decoder = Some(name);
                    self.manufacturer_value = Some(value);
                }
                Some((_, Err(err))) => {
                    log::debug!("manufacturer-data decode failed for {id:04x} on {}: {err}", self.address);
                    self.manufacturer_decoder = None;
                    self.manufacturer_value = None;
                }
                None => {
                    self.manufacturer_decoder = None;
                    self.manufacturer_value = None;
                }
            }
        }
        for (uuid, payload) in &ad.service_data {
            let datum = match decoders.decode_service(*uuid, payload) {
                Some((name, Ok(value))) => ServiceDatum { uuid: *uuid, name: Some(name), value },
                Some((_, Err(err))) => {
                    log::debug!("service-data decode failed for {uuid:04x} on {}: {err}", self.address);
                    ServiceDatum { uuid: *uuid, name: None, value: DecodedValue::Bytes(payload.clone()) }
                }
                None => ServiceDatum { uuid: *uuid, name: None, value: DecodedValue::Bytes(payload.clone()) },
            };
            self.service_data.insert(*uuid, datum);
        }
        self.adv_timestamp = Instant::now();
    }

    /// Looks up a discovered channel by its GATT handle.
    pub fn channel_by_handle(&self, handle: u16) -> Option<&Channel> {
        self.services.iter().flat_map(|s| &s.channels).find(|c| c.handle == handle)
    }

    /// Looks up a discovered channel by characteristic UUID, optionally
    /// scoped to one service UUID.
    pub fn channel_by_uuid(&self, service_uuid: Option<uuid::Uuid>, char_uuid: uuid::Uuid) -> Option<&Channel> {
        self.services
            .iter()
            .filter(|s| service_uuid.map_or(true, |want| want == s.uuid))
            .flat_map(|s| &s.channels)
            .find(|c| c.uuid == char_uuid)
    }

    /// Mutable lookup by GATT handle, used to persist the declared value
    /// type once a caller tells us how to decode a characteristic (a read,
    /// write, or notification subscription all carry one).
    pub fn channel_by_handle_mut(&mut self, handle: u16) -> Option<&mut Channel> {
        self.services.iter_mut().flat_map(|s| &mut s.channels).find(|c| c.handle == handle)
    }
}

/// The indexed store of known devices.
///
/// Cleared at the start of every scan cycle (`BLE_Device_Delegate` starts
/// each scan with an empty `self.entries` dict); updated in place as new
/// advertisements arrive. Guarded by an internal async mutex since both the
/// scan worker and command-handling tasks read and write it concurrently.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<Address, Device>>,
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { devices: Mutex::new(HashMap::new()) }
    }

    /// Drops all devices, as done at the start of every scan.
    pub async fn clear(&self) {
        self.devices.lock().await.clear();
    }

    /// Inserts a freshly-seen device, or merges the advertisement into the
    /// existing record if one is already known. Returns whether the device
    /// was newly inserted.
    pub async fn upsert(
        &self, address: Address, address_type: AddressType, rssi: Option<i16>, connectable: bool, ad: &AdvertisementRecord, decoders: &PayloadDecoderRegistry,
    ) -> bool {
        let mut devices = self.devices.lock().await;
        match devices.get_mut(&address) {
            Some(existing) => {
                existing.merge_advertisement(rssi, connectable, ad, decoders);
                false
            }
            None => {
                devices.insert(address, Device::from_scan_data(address, address_type, rssi, connectable, ad, decoders));
                true
            }
        }
    }

    /// Returns a snapshot copy of one device's state, if known.
    pub async fn get(&self, address: Address) -> Option<Device> {
        self.devices.lock().await.get(&address).cloned()
    }

    /// Returns snapshot copies of every known device.
    pub async fn all(&self) -> Vec<Device> {
        self.devices.lock().await.values().cloned().collect()
    }

    /// Applies `f` to a device's record in place, if known.
    pub async fn with_mut<R>(&self, address: Address, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        let mut devices = self.devices.lock().await;
        devices.get_mut(&address).map(f)
    }

    /// Number of known devices.
    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Whether the registry currently holds no devices.
    pub async fn is_empty(&self) -> bool {
        self.devices.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::AdvertisementRecord;

    fn blank_ad() -> AdvertisementRecord {
        AdvertisementRecord {
            local_name: None,
            flags: None,
            service_uuids: Vec::new(),
            service_data: HashMap::new(),
            manufacturer_id: None,
            manufacturer_data: Vec::new(),
            kind: BeaconKind::Standard,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_once_then_merges() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        assert!(registry.upsert(addr, AddressType::LePublic, Some(-70), true, &blank_ad(), &decoders).await);
        assert!(!registry.upsert(addr, AddressType::LePublic, Some(-60), true, &blank_ad(), &decoders).await);
        let device = registry.get(addr).await.unwrap();
        assert_eq!(device.last_rssi, Some(-60));
        assert_eq!(device.max_rssi, Some(-60));
    }

    #[tokio::test]
    async fn running_max_rssi_never_regresses() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &blank_ad(), &decoders).await;
        registry.upsert(addr, AddressType::LePublic, Some(-90), true, &blank_ad(), &decoders).await;
        let device = registry.get(addr).await.unwrap();
        assert_eq!(device.last_rssi, Some(-90));
        assert_eq!(device.max_rssi, Some(-50));
    }

    #[tokio::test]
    async fn clear_drops_all_devices() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        registry.upsert(Address::any(), AddressType::LePublic, None, false, &blank_ad(), &decoders).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn upsert_stores_the_flags_byte_from_the_advertisement() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let mut ad = blank_ad();
        ad.flags = Some(0x06);
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;
        let device = registry.get(addr).await.unwrap();
        assert_eq!(device.flags, Some(0x06));
    }

    #[tokio::test]
    async fn upsert_decodes_known_service_data_into_the_device_record() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let mut ad = blank_ad();
        ad.service_data.insert(0x2A6E, vec![0x34, 0x12]);
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;
        let device = registry.get(addr).await.unwrap();
        let datum = device.service_data.get(&0x2A6E).unwrap();
        assert_eq!(datum.name, Some("temperature"));
        match datum.value {
            DecodedValue::Float(celsius) => assert!((celsius - 46.60).abs() < 1e-9),
            ref other => panic!("expected float, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_decodes_registered_manufacturer_data_into_the_device_record() {
        let registry = DeviceRegistry::new();
        let mut decoders = PayloadDecoderRegistry::new();
        decoders.register_manufacturer(0x0499, "ruuvi_raw", |_payload| Ok(DecodedValue::Str("stub".into())));
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let mut ad = blank_ad();
        ad.manufacturer_id = Some(0x0499);
        ad.manufacturer_data = vec![0x03, 0x01];
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;
        let device = registry.get(addr).await.unwrap();
        assert_eq!(device.manufacturer_decoder, Some("ruuvi_raw"));
        assert_eq!(device.manufacturer_value, Some(DecodedValue::Str("stub".into())));
    }

    #[tokio::test]
    async fn upsert_leaves_manufacturer_decode_fields_unset_without_a_matching_decoder() {
        let registry = DeviceRegistry::new();
        let decoders = PayloadDecoderRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let mut ad = blank_ad();
        ad.manufacturer_id = Some(0xFFFF);
        ad.manufacturer_data = vec![0x00];
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;
        let device = registry.get(addr).await.unwrap();
        assert_eq!(device.manufacturer_id, Some(0xFFFF));
        assert!(device.manufacturer_decoder.is_none());
        assert!(device.manufacturer_value.is_none());
    }
}
