//! Concrete `org.bluez` D-Bus transport.
//!
//! Grounded on `adapter.rs`/`gatt/remote.rs`/`session.rs`: a
//! `dbus::nonblock::SyncConnection` driven by a background IO task,
//! `ObjectManager.GetManagedObjects` used to walk the existing device/
//! service/characteristic tree, and `PropertiesChanged`/`InterfacesAdded`
//! signal matching via `add_match`. Simplified to GATT-client operations
//! only: no Crossroads-hosted local GATT
//! server, no advertising, no mesh, no rfcomm/l2cap.

use crate::ad::RawAdvertisement;
use crate::adapter_trait::{
    DiscoveredCharacteristic, DiscoveredService, HciAdapter, Peripheral, RawNotification, RawValue, ScanEntry,
};
use crate::{Address, AddressType, Error, ErrorKind, InternalErrorKind, Result};
use async_trait::async_trait;
use dbus::arg::{cast, prop_cast, PropMap, RefArg, Variant};
use dbus::message::SignalArgs;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{
    ObjectManager, ObjectManagerInterfacesAdded, PropertiesPropertiesChanged,
};
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::strings::BusName;
use dbus::Path;
use dbus_tokio::connection;
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{spawn_blocking, JoinHandle};

pub(crate) const SERVICE_NAME: &str = "org.bluez";
const TIMEOUT: Duration = Duration::from_secs(25);

const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";
const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

type ManagedObjects = HashMap<Path<'static>, HashMap<String, PropMap>>;

async fn all_managed_objects(connection: &SyncConnection) -> Result<ManagedObjects> {
    let proxy = Proxy::new(SERVICE_NAME, "/", TIMEOUT, connection);
    proxy.get_managed_objects().await.map_err(dbus_err)
}

fn dbus_err(err: dbus::Error) -> Error {
    Error::with_message(ErrorKind::Internal(InternalErrorKind::DBus(err.to_string())), err.to_string())
}

fn prop<'a, T: 'static>(dict: &'a PropMap, key: &str) -> Option<&'a T> {
    prop_cast(dict, key)
}

fn service_bus_name() -> BusName<'static> {
    BusName::new(SERVICE_NAME).expect("\"org.bluez\" is a valid D-Bus bus name")
}

fn adapter_path(interface_name: &str) -> Result<Path<'static>> {
    Path::new(format!("/org/bluez/{interface_name}"))
        .map_err(|_| Error::new(ErrorKind::InvalidAddress(interface_name.to_string())))
}

fn device_path(adapter_path: &Path<'static>, address: Address) -> Path<'static> {
    Path::new(format!("{adapter_path}/dev_{}", address.to_string().to_uppercase().replace(':', "_")))
        .expect("a MAC address formats into a valid object path suffix")
}

/// Parses `/org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX[...]` back into an
/// [`Address`], scoped to `adapter_path`.
fn parse_device_address(path: &Path<'_>, adapter_path: &Path<'static>) -> Option<Address> {
    let prefix = adapter_path.to_string();
    let rest = path.strip_prefix(prefix.as_str())?;
    let rest = rest.strip_prefix("/dev_")?;
    let mac = &rest[..rest.find('/').unwrap_or(rest.len())];
    mac.replace('_', ":").parse().ok()
}

/// Parses the trailing `serviceXXXX`/`charXXXX`/`descXXXX` path segment
/// BlueZ assigns each GATT object into the numeric id this gateway uses as
/// its stable [`DiscoveredCharacteristic::handle`].
fn trailing_hex_id(path: &Path<'_>, prefix: &str) -> Option<u16> {
    let segment = path.rsplit('/').next()?;
    u16::from_str_radix(segment.strip_prefix(prefix)?, 16).ok()
}

/// A host controller interface backed by `org.bluez` over the system D-Bus.
pub struct BluezAdapter {
    connection: Arc<SyncConnection>,
    _io_task: JoinHandle<()>,
    adapter_path: Path<'static>,
    name: String,
}

impl BluezAdapter {
    /// Connects to the system bus and opens the named adapter (e.g. `hci0`).
    ///
    /// Does not fail if the adapter is not currently present; BlueZ objects
    /// are resolved lazily on each call, matching `Session::adapter` in the
    /// original binding, which never round-trips to the daemon.
    pub async fn new(interface_name: impl Into<String>) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let io_task = tokio::spawn(async move {
            let err = resource.await;
            log::error!("D-Bus connection lost: {err}");
        });
        log::trace!("connected to D-Bus with unique name {}", connection.unique_name());

        let name = interface_name.into();
        let adapter_path = adapter_path(&name)?;
        Ok(Self { connection, _io_task: io_task, adapter_path, name })
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, &self.adapter_path, TIMEOUT, &*self.connection)
    }
}

/// Stops discovery when the scan stream is dropped, mirroring the
/// start/stop pairing `Adapter::discovery_session` performs through a
/// single-session token in the original binding.
struct DiscoveryGuard {
    connection: Arc<SyncConnection>,
    adapter_path: Path<'static>,
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        let connection = self.connection.clone();
        let adapter_path = self.adapter_path.clone();
        tokio::spawn(async move {
            let proxy = Proxy::new(SERVICE_NAME, &adapter_path, TIMEOUT, &*connection);
            log::trace!("{adapter_path}: {SERVICE_NAME}.StopDiscovery ()");
            let result: std::result::Result<(), dbus::Error> = proxy.method_call(ADAPTER_INTERFACE, "StopDiscovery", ()).await;
            log::trace!("{adapter_path}: {SERVICE_NAME}.StopDiscovery () -> {result:?}");
        });
    }
}

#[async_trait]
impl HciAdapter for BluezAdapter {
    type Peripheral = BluezPeripheral;

    async fn discover(&self) -> Result<futures::stream::BoxStream<'static, ScanEntry>> {
        let filter: PropMap = [
            ("Transport".to_string(), Variant(Box::new("le".to_string()) as Box<dyn RefArg>)),
            ("DuplicateData".to_string(), Variant(Box::new(true) as Box<dyn RefArg>)),
        ]
        .into_iter()
        .collect();
        self.proxy().method_call(ADAPTER_INTERFACE, "SetDiscoveryFilter", (filter,)).await.map_err(dbus_err)?;
        self.proxy().method_call(ADAPTER_INTERFACE, "StartDiscovery", ()).await.map_err(dbus_err)?;

        let guard = Arc::new(DiscoveryGuard { connection: self.connection.clone(), adapter_path: self.adapter_path.clone() });

        let known: Vec<ScanEntry> = all_managed_objects(&self.connection)
            .await?
            .into_iter()
            .filter_map(|(path, interfaces)| {
                let address = parse_device_address(&path, &self.adapter_path)?;
                let props = interfaces.get(DEVICE_INTERFACE)?;
                Some(scan_entry_from_props(address, props))
            })
            .collect();

        let bus_name = service_bus_name();
        let added_rule = ObjectManagerInterfacesAdded::match_rule(Some(&bus_name), None);
        let (added_token, mut added_stream) = self.connection.add_match(added_rule).await.map_err(dbus_err)?.msg_stream();
        let prop_rule = PropertiesPropertiesChanged::match_rule(Some(&bus_name), None);
        let (prop_token, mut prop_stream) = self.connection.add_match(prop_rule).await.map_err(dbus_err)?.msg_stream();

        let adapter_path = self.adapter_path.clone();
        let (tx, rx) = mpsc::unbounded();

        tokio::spawn(async move {
            let _added_token = added_token;
            let _prop_token = prop_token;
            loop {
                tokio::select! {
                    msg = added_stream.next() => {
                        let Some(msg) = msg else { break };
                        if let Some(ObjectManagerInterfacesAdded { object, interfaces }) = ObjectManagerInterfacesAdded::from_message(&msg) {
                            if let Some(address) = parse_device_address(&object, &adapter_path) {
                                if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                                    if tx.unbounded_send(scan_entry_from_props(address, props)).is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    msg = prop_stream.next() => {
                        let Some(msg) = msg else { break };
                        if let (Some(object), Some(evt)) = (msg.path(), PropertiesPropertiesChanged::from_message(&msg)) {
                            if evt.interface_name == DEVICE_INTERFACE {
                                if let Some(address) = parse_device_address(&object, &adapter_path) {
                                    if tx.unbounded_send(scan_entry_from_props(address, &evt.changed_properties)).is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let live = rx.map(move |entry| {
            let _keep_alive = &guard;
            entry
        });
        Ok(Box::pin(stream::iter(known).chain(live)))
    }

    async fn connect(&self, address: Address, _address_type: AddressType, _mtu: u16) -> Result<Self::Peripheral> {
        let device_path = device_path(&self.adapter_path, address);
        let proxy = Proxy::new(SERVICE_NAME, &device_path, TIMEOUT, &*self.connection);
        log::trace!("{device_path}: {SERVICE_NAME}.Connect ()");
        proxy
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Connect", ())
            .await
            .map_err(|err| Error::with_message(ErrorKind::ConnectFailed, err.to_string()))?;

        // BlueZ resolves services asynchronously after `Connect` returns; give
        // it a short window before handing back a peripheral whose
        // `discover_services` would otherwise see an empty tree.
        for _ in 0..20 {
            let resolved = proxy
                .method_call::<(Variant<bool>,), _, _, _>(
                    "org.freedesktop.DBus.Properties",
                    "Get",
                    (DEVICE_INTERFACE, "ServicesResolved"),
                )
                .await
                .ok()
                .map(|(v,)| v.0);
            if resolved == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        BluezPeripheral::new(self.connection.clone(), device_path).await
    }

    fn interface_name(&self) -> &str {
        &self.name
    }
}

fn scan_entry_from_props(address: Address, props: &PropMap) -> ScanEntry {
    let address_type = match prop::<String>(props, "AddressType").map(String::as_str) {
        Some("random") => AddressType::LeRandom,
        _ => AddressType::LePublic,
    };
    ScanEntry {
        address,
        address_type,
        rssi: prop::<i16>(props, "RSSI").copied(),
        connectable: prop::<bool>(props, "Connected").copied().unwrap_or(true),
        advertisement: synthesize_advertisement(props),
    }
}

/// Reconstructs an over-the-air-shaped [`RawAdvertisement`] from BlueZ's
/// already demultiplexed `org.bluez.Device1` properties, since this gateway's
/// [`crate::ad::AdParser`] is written against AD structures rather than
/// BlueZ's property names.
fn synthesize_advertisement(props: &PropMap) -> RawAdvertisement {
    use crate::ad::parser::{data_type, AdStructure};

    let mut structures = Vec::new();

    if let Some(flags) = prop::<Vec<u8>>(props, "AdvertisingFlags") {
        if let Some(&first) = flags.first() {
            structures.push(AdStructure { ad_type: data_type::FLAGS, value: vec![first] });
        }
    }
    if let Some(name) = prop::<String>(props, "Name") {
        structures.push(AdStructure { ad_type: data_type::COMPLETE_LOCAL_NAME, value: name.clone().into_bytes() });
    }
    if let Some(uuids) = prop::<Vec<String>>(props, "UUIDs") {
        let mut bytes = Vec::new();
        for uuid in uuids {
            if let Some(short) = short_uuid(uuid) {
                bytes.extend_from_slice(&short.to_le_bytes());
            }
        }
        if !bytes.is_empty() {
            structures.push(AdStructure { ad_type: data_type::COMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS, value: bytes });
        }
    }
    if let Some(mfg) = prop::<HashMap<u16, Variant<Box<dyn RefArg + 'static>>>>(props, "ManufacturerData") {
        if let Some((&id, data)) = mfg.iter().next() {
            let mut value = id.to_le_bytes().to_vec();
            if let Some(bytes) = cast::<Vec<u8>>(&*data.0) {
                value.extend_from_slice(bytes);
            }
            structures.push(AdStructure { ad_type: data_type::MANUFACTURER_SPECIFIC_DATA, value });
        }
    }
    if let Some(svc) = prop::<HashMap<String, Variant<Box<dyn RefArg + 'static>>>>(props, "ServiceData") {
        for (uuid, data) in svc {
            if let (Some(short), Some(bytes)) = (short_uuid(uuid), cast::<Vec<u8>>(&*data.0)) {
                let mut value = short.to_le_bytes().to_vec();
                value.extend_from_slice(bytes);
                structures.push(AdStructure { ad_type: data_type::SERVICE_DATA_16_BIT, value });
            }
        }
    }

    RawAdvertisement { structures }
}

/// Extracts the 16-bit short form of a full UUID string, when it sits within
/// the Bluetooth Base UUID range.
fn short_uuid(uuid: &str) -> Option<u16> {
    let parsed: uuid::Uuid = uuid.parse().ok()?;
    let bytes = parsed.as_bytes();
    let base = uuid::Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);
    let mut candidate = *base.as_bytes();
    candidate[0..2].copy_from_slice(&bytes[0..2]);
    (candidate == *bytes).then(|| u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// One connected remote device, identified by its BlueZ device object path.
pub struct BluezPeripheral {
    connection: Arc<SyncConnection>,
    device_path: Path<'static>,
    handles: Arc<AsyncMutex<HashMap<u16, Path<'static>>>>,
    notifications: AsyncMutex<mpsc::UnboundedReceiver<RawNotification>>,
    _notify_task: JoinHandle<()>,
}

impl BluezPeripheral {
    async fn new(connection: Arc<SyncConnection>, device_path: Path<'static>) -> Result<Self> {
        let handles = Arc::new(AsyncMutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded();

        let bus_name = service_bus_name();
        let rule = PropertiesPropertiesChanged::match_rule(Some(&bus_name), None);
        let (notify_token, mut stream) = connection.add_match(rule).await.map_err(dbus_err)?.msg_stream();

        let task_handles = handles.clone();
        let task_prefix = device_path.to_string();
        let notify_task = tokio::spawn(async move {
            let _notify_token = notify_token;
            while let Some(msg) = stream.next().await {
                let Some(object) = msg.path() else { continue };
                let Some(evt) = PropertiesPropertiesChanged::from_message(&msg) else { continue };
                if evt.interface_name != CHARACTERISTIC_INTERFACE || !object.starts_with(task_prefix.as_str()) {
                    continue;
                }
                let Some(handle) = trailing_hex_id(&object, "char") else { continue };
                let Some(value) = prop::<Vec<u8>>(&evt.changed_properties, "Value") else { continue };
                let known = task_handles.lock().await.contains_key(&handle);
                if known && tx.unbounded_send(RawNotification { handle, value: value.clone() }).is_err() {
                    break;
                }
            }
        });

        Ok(Self { connection, device_path, handles, notifications: AsyncMutex::new(rx), _notify_task: notify_task })
    }

    fn proxy_for<'a>(&'a self, path: &'a Path<'static>) -> Proxy<'a, &'a SyncConnection> {
        Proxy::new(SERVICE_NAME, path, TIMEOUT, &*self.connection)
    }

    async fn path_for(&self, handle: u16) -> Result<Path<'static>> {
        self.handles.lock().await.get(&handle).cloned().ok_or_else(|| Error::new(ErrorKind::NotFound))
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>> {
        let objects = all_managed_objects(&self.connection).await?;
        let device_prefix = self.device_path.to_string();
        let mut handles = self.handles.lock().await;
        handles.clear();

        let mut services = Vec::new();
        let mut service_paths: Vec<_> =
            objects.iter().filter(|(path, ifaces)| path.starts_with(&device_prefix) && ifaces.contains_key(SERVICE_INTERFACE)).collect();
        service_paths.sort_by_key(|(path, _)| path.to_string());

        for (service_path, service_ifaces) in service_paths {
            let service_props = &service_ifaces[SERVICE_INTERFACE];
            let Some(uuid) = prop::<String>(service_props, "UUID").and_then(|s| s.parse().ok()) else { continue };
            let primary = prop::<bool>(service_props, "Primary").copied().unwrap_or(true);

            let service_prefix = service_path.to_string();
            let mut char_paths: Vec<_> =
                objects.iter().filter(|(path, ifaces)| path.starts_with(&service_prefix) && ifaces.contains_key(CHARACTERISTIC_INTERFACE)).collect();
            char_paths.sort_by_key(|(path, _)| path.to_string());

            let mut characteristics = Vec::new();
            for (char_path, char_ifaces) in char_paths {
                let char_props = &char_ifaces[CHARACTERISTIC_INTERFACE];
                let Some(uuid) = prop::<String>(char_props, "UUID").and_then(|s| s.parse().ok()) else { continue };
                let Some(handle) = trailing_hex_id(char_path, "char") else { continue };
                let flags: Vec<String> = prop::<Vec<String>>(char_props, "Flags").cloned().unwrap_or_default();

                let char_prefix = char_path.to_string();
                let cccd_handle = objects
                    .iter()
                    .filter(|(path, ifaces)| path.starts_with(&char_prefix) && ifaces.contains_key(DESCRIPTOR_INTERFACE))
                    .find_map(|(path, ifaces)| {
                        let uuid = prop::<String>(&ifaces[DESCRIPTOR_INTERFACE], "UUID")?;
                        uuid.eq_ignore_ascii_case(CCCD_UUID).then(|| trailing_hex_id(path, "desc")).flatten()
                    });

                handles.insert(handle, char_path.clone());
                if let Some(cccd) = cccd_handle {
                    if let Some((desc_path, _)) = objects.iter().find(|(path, _)| trailing_hex_id(path, "desc") == Some(cccd)) {
                        handles.insert(cccd, desc_path.clone());
                    }
                }

                characteristics.push(DiscoveredCharacteristic {
                    uuid,
                    handle,
                    readable: flags.iter().any(|f| f == "read"),
                    writable: flags.iter().any(|f| f == "write" || f == "write-without-response"),
                    notifiable: flags.iter().any(|f| f == "notify" || f == "indicate"),
                    cccd_handle,
                });
            }

            services.push(DiscoveredService { uuid, primary, characteristics });
        }

        Ok(services)
    }

    async fn read(&self, handle: u16) -> Result<RawValue> {
        let path = self.path_for(handle).await?;
        let options = PropMap::new();
        log::trace!("{path}: {SERVICE_NAME}.ReadValue ()");
        let (value,): (Vec<u8>,) =
            self.proxy_for(&path).method_call(CHARACTERISTIC_INTERFACE, "ReadValue", (options,)).await.map_err(dbus_err)?;
        Ok(value)
    }

    async fn write(&self, handle: u16, value: &[u8]) -> Result<()> {
        let path = self.path_for(handle).await?;
        let options = PropMap::new();
        log::trace!("{path}: {SERVICE_NAME}.WriteValue ({} bytes)", value.len());
        self.proxy_for(&path)
            .method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "WriteValue", (value.to_vec(), options))
            .await
            .map_err(dbus_err)?;
        Ok(())
    }

    async fn wait_for_notification(&self, timeout: Duration) -> Result<Option<RawNotification>> {
        let mut rx = self.notifications.lock().await;
        match tokio::time::timeout(timeout, rx.next()).await {
            Ok(Some(notification)) => Ok(Some(notification)),
            Ok(None) => Err(Error::new(ErrorKind::Transport("notification stream closed".to_string()))),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        log::trace!("{}: {SERVICE_NAME}.Disconnect ()", self.device_path);
        let proxy = self.proxy_for(&self.device_path);
        match proxy.method_call::<(), _, _, _>(DEVICE_INTERFACE, "Disconnect", ()).await {
            Ok(()) => Ok(()),
            Err(err) if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") => Ok(()),
            Err(err) => Err(dbus_err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_round_trips_through_parsing() {
        let adapter = adapter_path("hci0").unwrap();
        let addr = Address::new([0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33]);
        let path = device_path(&adapter, addr);
        assert_eq!(path.to_string(), "/org/bluez/hci0/dev_AA_BB_CC_11_22_33");
        assert_eq!(parse_device_address(&path, &adapter), Some(addr));
    }

    #[test]
    fn trailing_hex_id_parses_service_and_characteristic_segments() {
        let path = Path::new("/org/bluez/hci0/dev_AA_BB_CC_11_22_33/service0012/char0034").unwrap();
        assert_eq!(trailing_hex_id(&path, "char"), Some(0x0034));
        assert_eq!(trailing_hex_id(&path, "service"), None);
    }

    #[test]
    fn short_uuid_recognizes_bluetooth_base_uuid_range() {
        assert_eq!(short_uuid("0000180f-0000-1000-8000-00805f9b34fb"), Some(0x180f));
        assert_eq!(short_uuid("12345678-90ab-cdef-1234-567890abcdef"), None);
    }
}
