//! The transport boundary the session manager is built against.
//!
//! Nothing above this module knows about D-Bus, BlueZ, or any other host
//! controller interface. A concrete implementation lives in [`crate::bluez`]
//! when the `bluez` feature is enabled; tests substitute an in-memory fake.

use crate::{ad::RawAdvertisement, Address, AddressType, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A raw GATT characteristic or descriptor value, as bytes on the wire.
pub type RawValue = Vec<u8>;

/// A notification delivered by [`Peripheral::wait_for_notification`].
#[derive(Clone, Debug)]
pub struct RawNotification {
    /// Characteristic handle the notification was delivered for.
    pub handle: u16,
    /// Raw notification payload.
    pub value: RawValue,
}

/// One connected remote device, as seen by the transport.
///
/// Implementations are not required to be `Clone`; the session manager holds
/// exactly one `Peripheral` per connected device behind its transaction lock.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Enumerates services and characteristics, populating the handle table
    /// used by subsequent read/write/notify calls.
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>>;

    /// Reads the current value of a characteristic or descriptor by handle.
    async fn read(&self, handle: u16) -> Result<RawValue>;

    /// Writes a value to a characteristic or descriptor by handle.
    async fn write(&self, handle: u16, value: &[u8]) -> Result<()>;

    /// Blocks until a notification arrives or `timeout` elapses, whichever
    /// is first. Returns `Ok(None)` on timeout (not an error).
    async fn wait_for_notification(&self, timeout: Duration) -> Result<Option<RawNotification>>;

    /// Tears down the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// A discovered GATT service, as reported by [`Peripheral::discover_services`].
#[derive(Clone, Debug)]
pub struct DiscoveredService {
    /// 16-bit or full service UUID.
    pub uuid: uuid::Uuid,
    /// Whether this is the device's primary service.
    pub primary: bool,
    /// Characteristics belonging to this service.
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// A discovered GATT characteristic.
#[derive(Clone, Debug)]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID.
    pub uuid: uuid::Uuid,
    /// Handle used for subsequent read/write/notify calls.
    pub handle: u16,
    /// Whether the characteristic supports `read`.
    pub readable: bool,
    /// Whether the characteristic supports `write` (with or without response).
    pub writable: bool,
    /// Whether the characteristic supports `notify` or `indicate`.
    pub notifiable: bool,
    /// Handle of the `0x2902` Client Characteristic Configuration descriptor,
    /// when present.
    pub cccd_handle: Option<u16>,
}

/// Discovery event delivered by [`HciAdapter::discover`].
#[derive(Clone, Debug)]
pub struct ScanEntry {
    /// Advertiser address.
    pub address: Address,
    /// Advertiser address type.
    pub address_type: AddressType,
    /// Received signal strength, in dBm, for this individual frame.
    pub rssi: Option<i16>,
    /// Whether BlueZ reports the device as connectable.
    pub connectable: bool,
    /// The raw advertisement payload for this frame.
    pub advertisement: RawAdvertisement,
}

/// A host controller interface abstraction.
///
/// One `HciAdapter` corresponds to one radio (e.g. `hci0`). The session
/// manager assumes it may not scan and connect at the same time on the same
/// adapter and serializes the two itself (see [`crate::orchestrator`]); the
/// adapter is not required to enforce this itself.
#[async_trait]
pub trait HciAdapter: Send + Sync {
    /// The concrete peripheral handle type this adapter opens connections as.
    type Peripheral: Peripheral;

    /// Starts scanning and returns a stream of discovery events.
    ///
    /// The scan runs until the returned stream is dropped.
    async fn discover(&self) -> Result<futures::stream::BoxStream<'static, ScanEntry>>;

    /// Opens a connection to `address`, using `address_type`, requesting the
    /// given ATT MTU where the transport supports negotiating one.
    async fn connect(&self, address: Address, address_type: AddressType, mtu: u16) -> Result<Self::Peripheral>;

    /// Name of the interface this adapter drives (e.g. `"hci0"`).
    fn interface_name(&self) -> &str;
}
