//! Scan/connect exclusion and message-bus command routing.
//!
//! Grounded on `ble_mqtt_service.py`'s central dispatch loop: one process
//! subscribes to the three inbound command topic families and fans each
//! message out to the scanner, filter chain or a device's GATT session,
//! publishing results back onto the bus. `ExclusionGate` is this module's
//! own addition: the original relies on a single Python
//! thread and a `threading.Lock` around the shared `bluepy` adapter handle
//! to keep scanning and connecting from overlapping; here that lock is a
//! `tokio::sync::Notify`-backed gate that either side can wait on.

use crate::ad::vendor::ruuvi;
use crate::ad::PayloadDecoderRegistry;
use crate::adapter_trait::HciAdapter;
use crate::device::DeviceRegistry;
use crate::dispatch::{CallbackDispatcher, ScanDelegate};
use crate::filter::FilterChain;
use crate::gatt::ops;
use crate::message::{
    AdvertisementEvent, AdvertisementMode, FilterSpec, GattCommand, GattCommandKind, GattResultEvent, Inbound, MessageBus, ResultMode, ScanCommand, ScanCommandKind, ScanResultEvent, Topics,
};
use crate::scanner::Scanner;
use crate::session::SessionManager;
use crate::{error_code, Address, AddressType};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Mutual-exclusion gate between the scan activity and GATT connections.
///
/// A scan holds the gate "busy" for as long as its discovery stream is
/// open; each connected device holds it busy independently, by count. The
/// two sides wait on different conditions, mirroring `BLE_Client.py`'s
/// `devConnect`, which blocks on `scanOn()` alone while `_connectedDev` holds
/// many simultaneous connections (`max_connect`): a scan may only start once
/// neither a scan nor any device is holding the gate
/// ([`ExclusionGate::wait_idle`]/[`ExclusionGate::is_idle`]), but a GATT
/// connect only needs the scan itself to have finished
/// ([`ExclusionGate::wait_scan_finished`]/[`ExclusionGate::is_scan_active`])
/// — any number of devices may be connected at once.
pub struct ExclusionGate {
    scanning: AtomicBool,
    connected: AtomicUsize,
    idle: Notify,
    scan_finished: Notify,
}

impl Default for ExclusionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusionGate {
    /// Builds a gate with nothing holding it.
    pub fn new() -> Self {
        Self { scanning: AtomicBool::new(false), connected: AtomicUsize::new(0), idle: Notify::new(), scan_finished: Notify::new() }
    }

    /// Whether neither a scan nor any connected device currently holds the gate.
    pub fn is_idle(&self) -> bool {
        !self.scanning.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst) == 0
    }

    /// Waits until [`ExclusionGate::is_idle`] holds. Used by the scan side,
    /// which may not start while any device is connected.
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            self.idle.notified().await;
        }
    }

    /// Whether a scan currently holds the gate, irrespective of how many
    /// devices are connected.
    pub fn is_scan_active(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Waits until no scan is active. Used by the GATT/connect side, which
    /// may proceed alongside any number of already-connected devices.
    pub async fn wait_scan_finished(&self) {
        while self.is_scan_active() {
            self.scan_finished.notified().await;
        }
    }

    /// Called by [`crate::session::SessionManager`] on a successful connect.
    pub fn device_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    /// Wakes GATT/connect waiters without requiring any device to disconnect.
    fn notify_scan_finished(&self) {
        self.scan_finished.notify_waiters();
    }

    /// Called by [`crate::session::SessionManager`] once a device is fully
    /// torn down. Wakes waiters only when the last connected device clears.
    pub fn device_disconnected(&self) {
        if self.connected.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Marks a scan as holding the gate until the returned guard drops.
    pub fn enter_scan(self: &Arc<Self>) -> ScanGuard {
        self.scanning.store(true, Ordering::SeqCst);
        ScanGuard { gate: self.clone() }
    }
}

/// RAII handle released by [`ExclusionGate::enter_scan`].
pub struct ScanGuard {
    gate: Arc<ExclusionGate>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.gate.scanning.store(false, Ordering::SeqCst);
        self.gate.idle.notify_waiters();
        self.gate.notify_scan_finished();
    }
}

/// Per-scan-command publication settings, read back by the
/// [`CallbackDispatcher`] hooks on every advertisement/scan-end report.
///
/// Lives outside [`ScanCommand`] because the command that started a scan may
/// have long since been dropped by the time a given advertisement arrives —
/// the settings it requested must outlive it for the whole scan cycle.
struct ScanSettings {
    result: ResultMode,
    advertisement: AdvertisementMode,
    sub_topics: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { result: ResultMode::None, advertisement: AdvertisementMode::None, sub_topics: false }
    }
}

/// Routes inbound `scan`/`filter`/`gatt` commands to the scanner, filter
/// chain and GATT session layers, and publishes their results back onto the
/// bus.
pub struct Orchestrator<A: HciAdapter> {
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    registry: Arc<DeviceRegistry>,
    filters: Arc<Mutex<FilterChain>>,
    sessions: Arc<SessionManager<A>>,
    scanner: Arc<Scanner<A>>,
    gate: Arc<ExclusionGate>,
    dispatcher: Arc<CallbackDispatcher>,
    settings: Arc<Mutex<ScanSettings>>,
}

impl<A: HciAdapter + 'static> Orchestrator<A> {
    /// Builds an orchestrator for gateway `gw_id`, driving `adapter` and
    /// publishing through `bus`.
    pub fn new(gw_id: impl Into<String>, adapter: Arc<A>, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let gw_id = gw_id.into();
        let topics = Topics::new(gw_id.clone());
        let registry = Arc::new(DeviceRegistry::new());
        let filters = Arc::new(Mutex::new(FilterChain::new()));
        let gate = Arc::new(ExclusionGate::new());
        let sessions = Arc::new(SessionManager::new(adapter.clone(), registry.clone()).with_gate(gate.clone()));
        let settings = Arc::new(Mutex::new(ScanSettings::default()));

        let delegate = build_delegate(topics.clone(), bus.clone(), registry.clone(), settings.clone());
        let dispatcher = Arc::new(CallbackDispatcher::new(delegate));
        let mut decoders = PayloadDecoderRegistry::new();
        decoders.register_manufacturer(ruuvi::RUUVI_MANUFACTURER_ID, "ruuvi", ruuvi::decode);
        let scanner = Arc::new(
            Scanner::new(adapter, registry.clone(), filters.clone(), dispatcher.clone(), sessions.clone(), gate.clone()).with_decoders(Arc::new(decoders)),
        );

        Arc::new(Self { topics, bus, registry, filters, sessions, scanner, gate, dispatcher, settings })
    }

    /// Subscribes to this gateway's command topics and processes messages
    /// until the bus's stream ends. Each message is handled independently
    /// on its own task so a slow GATT transaction never delays scan-command
    /// or filter-reconfiguration processing.
    pub async fn run(self: &Arc<Self>) -> crate::Result<()> {
        let mut inbound = self.bus.subscribe(self.topics.gw_id()).await?;
        while let Some(message) = inbound.next().await {
            let orchestrator = self.clone();
            tokio::spawn(async move { orchestrator.handle(message).await });
        }
        Ok(())
    }

    async fn handle(self: Arc<Self>, message: Inbound) {
        if self.topics.is_scan_topic(&message.topic) {
            self.handle_scan(&message.payload).await;
        } else if self.topics.is_filter_topic(&message.topic) {
            self.handle_filter(&message.payload).await;
        } else if let Some(address) = self.topics.parse_gatt_topic(&message.topic) {
            self.handle_gatt(address, &message.payload).await;
        } else {
            log::debug!("ignoring message on unrecognized topic {}", message.topic);
        }
    }

    async fn handle_scan(self: &Arc<Self>, payload: &[u8]) {
        let cmd: ScanCommand = match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::warn!("malformed scan command: {err}");
                return;
            }
        };

        if matches!(cmd.command, ScanCommandKind::Stop) {
            self.scanner.stop().await;
            return;
        }

        {
            let mut settings = self.settings.lock().await;
            settings.result = cmd.result;
            settings.advertisement = cmd.advertisement;
            settings.sub_topics = cmd.sub_topics;
        }
        self.dispatcher.set_adv_report_interval(Duration::from_secs(cmd.adv_interval));

        let result = match cmd.command {
            ScanCommandKind::Start => match cmd.timeout.filter(|t| *t > 0) {
                Some(secs) => self.scanner.scan_async(Duration::from_secs(secs), cmd.force_disconnect).await,
                None => self.scanner.scan_indefinite(cmd.force_disconnect).await,
            },
            ScanCommandKind::TimeScan => {
                let timeout = Duration::from_secs(cmd.timeout.unwrap_or(0));
                let period = Duration::from_secs(cmd.period.unwrap_or(cmd.timeout.unwrap_or(0)));
                self.scanner.scan_periodic(timeout, period).await
            }
            ScanCommandKind::Stop => unreachable!("handled above"),
        };

        if let Err(err) = result {
            log::error!("scan command failed to start: {err}");
        }
    }

    async fn handle_filter(self: &Arc<Self>, payload: &[u8]) {
        let specs: Vec<FilterSpec> = match serde_json::from_slice(payload) {
            Ok(specs) => specs,
            Err(err) => {
                log::warn!("malformed filter command: {err}");
                return;
            }
        };
        let mut chain = FilterChain::new();
        for spec in specs {
            if let Some(filter) = spec.into_filter() {
                chain.push(filter);
            }
        }
        *self.filters.lock().await = chain;
    }

    async fn handle_gatt(self: &Arc<Self>, address: Address, payload: &[u8]) {
        let cmd: GattCommand = match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::warn!("malformed gatt command for {address}: {err}");
                return;
            }
        };

        if !cmd.queue && self.gate.is_scan_active() {
            self.publish_gatt_result(address, &cmd, Err(error_code::TRANSPORT_EXCEPTION), None, None).await;
            return;
        }
        self.gate.wait_scan_finished().await;

        let address_type = self.registry.get(address).await.map(|d| d.address_type).unwrap_or(AddressType::LePublic);
        let actions = cmd.actions();

        match cmd.command {
            GattCommandKind::Read => {
                let outcome = ops::read_characteristics(&self.sessions, &self.registry, address, address_type, &actions, cmd.keep).await;
                match outcome {
                    Ok(values) => self.publish_gatt_result(address, &cmd, Ok(()), Some(values), None).await,
                    Err(err) => {
                        let code = ops::error_code_for(false, false, &err);
                        self.publish_gatt_result(address, &cmd, Err(code), None, None).await;
                    }
                }
            }
            GattCommandKind::Write => {
                let outcome = ops::write_characteristics(&self.sessions, &self.registry, address, address_type, &actions, cmd.keep).await;
                match outcome {
                    Ok(()) => self.publish_gatt_result(address, &cmd, Ok(()), None, None).await,
                    Err(err) => {
                        let code = ops::error_code_for(true, false, &err);
                        self.publish_gatt_result(address, &cmd, Err(code), None, None).await;
                    }
                }
            }
            GattCommandKind::Discover => {
                let outcome = ops::discover(&self.sessions, &self.registry, address, address_type, cmd.keep, cmd.service.as_deref(), cmd.properties).await;
                match outcome {
                    Ok(services) => self.publish_gatt_result(address, &cmd, Ok(()), None, Some(services)).await,
                    Err(err) => {
                        let code = ops::error_code_for(false, false, &err);
                        self.publish_gatt_result(address, &cmd, Err(code), None, None).await;
                    }
                }
            }
            GattCommandKind::AllowNotifications => {
                let dispatcher = self.dispatcher.clone();
                let outcome = ops::allow_notifications(&self.sessions, &self.registry, address, address_type, &actions, cmd.keep, move |addr, notification| {
                    let event = GattResultEvent {
                        command: "notification".to_string(),
                        error: error_code::SUCCESS,
                        transac_id: None,
                        values: Some(vec![crate::message::GattResultValue {
                            characteristic: format!("{:04x}", notification.handle),
                            value_type: crate::gatt::ValueType::Raw.code(),
                            value: serde_json::Value::String(hex::encode(&notification.value)),
                        }]),
                        services: None,
                    };
                    dispatcher.report_gatt_result(addr, &event);
                })
                .await;
                match outcome {
                    Ok(()) => self.publish_gatt_result(address, &cmd, Ok(()), None, None).await,
                    Err(err) => {
                        let code = ops::error_code_for(false, true, &err);
                        self.publish_gatt_result(address, &cmd, Err(code), None, None).await;
                    }
                }
            }
        }
    }

    async fn publish_gatt_result(
        &self, address: Address, cmd: &GattCommand, outcome: Result<(), i32>, values: Option<Vec<crate::message::GattResultValue>>, services: Option<serde_json::Value>,
    ) {
        let command = match cmd.command {
            GattCommandKind::Read => "read",
            GattCommandKind::Write => "write",
            GattCommandKind::Discover => "discover",
            GattCommandKind::AllowNotifications => "allow_notifications",
        };
        let error = outcome.err().unwrap_or(error_code::SUCCESS);
        let event = GattResultEvent { command: command.to_string(), error, transac_id: cmd.transac_id, values, services };
        self.dispatcher.report_gatt_result(address, &event);
    }
}

/// Builds the [`ScanDelegate`] that bridges [`CallbackDispatcher`]'s
/// synchronous hooks to asynchronous bus publication. Each hook spawns a
/// short-lived task to perform the actual `publish`, matching the
/// dispatcher's own "never block the scan loop on a callback" contract.
fn build_delegate(topics: Topics, bus: Arc<dyn MessageBus>, registry: Arc<DeviceRegistry>, settings: Arc<Mutex<ScanSettings>>) -> ScanDelegate {
    let adv_topics = topics.clone();
    let adv_bus = bus.clone();
    let adv_settings = settings.clone();
    let on_advertisement = move |_device: &crate::device::Device, event: &AdvertisementEvent| {
        let topics = adv_topics.clone();
        let bus = adv_bus.clone();
        let settings = adv_settings.clone();
        let event = event.clone();
        tokio::spawn(async move {
            let mode = settings.lock().await.advertisement;
            if mode == AdvertisementMode::None {
                return;
            }
            let payload = match mode {
                AdvertisementMode::Min => serde_json::json!({
                    "address": event.address, "name": event.name, "rssi": event.rssi,
                }),
                _ => serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
            };
            publish_json(&bus, topics.advertisement(event.address, None), &payload).await;

            if settings.lock().await.sub_topics {
                if let Some(sub) = sub_topic_for(&event) {
                    publish_json(&bus, topics.advertisement(event.address, Some(&sub)), &payload).await;
                }
            }
        });
    };

    let end_topics = topics.clone();
    let end_bus = bus.clone();
    let end_registry = registry;
    let end_settings = settings;
    let on_scan_end = move |event: &ScanResultEvent| {
        let topics = end_topics.clone();
        let bus = end_bus.clone();
        let registry = end_registry.clone();
        let settings = end_settings.clone();
        let mut event = event.clone();
        tokio::spawn(async move {
            let mode = settings.lock().await.result;
            event.devices = match mode {
                ResultMode::Devices => {
                    let devices = registry.all().await;
                    Some(devices.iter().map(crate::scanner::advertisement_event).collect())
                }
                ResultMode::Summary | ResultMode::None => None,
            };
            publish_json(&bus, topics.scan_result(), &event).await;
        });
    };

    let result_topics = topics;
    let result_bus = bus;
    let on_notification = move |address: Address, event: &GattResultEvent| {
        let topic = result_topics.gatt_result(address);
        let bus = result_bus.clone();
        let event = event.clone();
        tokio::spawn(async move {
            publish_json(&bus, topic, &event).await;
        });
    };

    ScanDelegate { on_advertisement: Some(Box::new(on_advertisement)), on_scan_end: Some(Box::new(on_scan_end)), on_notification: Some(Box::new(on_notification)) }
}

async fn publish_json(bus: &Arc<dyn MessageBus>, topic: String, value: &impl serde::Serialize) {
    match serde_json::to_vec(value) {
        Ok(payload) => {
            if let Err(err) = bus.publish(&topic, payload).await {
                log::error!("publish to {topic} failed: {err}");
            }
        }
        Err(err) => log::error!("failed to serialize payload for {topic}: {err}"),
    }
}

/// Picks the decoded sub-topic an advertisement should additionally publish
/// under, when the originating scan command asked for `sub_topics: true`:
/// the beacon framing if recognized, else the first decoded (non-hex-
/// fallback) service-data key.
fn sub_topic_for(event: &AdvertisementEvent) -> Option<String> {
    match event.kind {
        "eddystone" => Some("eddystone".to_string()),
        "ibeacon" => Some("ibeacon".to_string()),
        _ => event
            .service_data
            .keys()
            .find(|key| !(key.len() == 4 && key.chars().all(|c| c.is_ascii_hexdigit())))
            .cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_starts_idle_and_tracks_connected_devices() {
        let gate = Arc::new(ExclusionGate::new());
        assert!(gate.is_idle());
        gate.device_connected();
        assert!(!gate.is_idle());
        gate.device_disconnected();
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn scan_guard_holds_the_gate_until_dropped() {
        let gate = Arc::new(ExclusionGate::new());
        let guard = gate.enter_scan();
        assert!(!gate.is_idle());
        drop(guard);
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_already_idle() {
        let gate = Arc::new(ExclusionGate::new());
        tokio::time::timeout(Duration::from_millis(50), gate.wait_idle()).await.unwrap();
    }

    #[tokio::test]
    async fn connects_do_not_block_each_other_only_a_live_scan_does() {
        let gate = Arc::new(ExclusionGate::new());
        gate.device_connected();
        gate.device_connected();
        assert!(!gate.is_idle());
        assert!(!gate.is_scan_active());
        // A second connect is not blocked by devices already connected.
        tokio::time::timeout(Duration::from_millis(50), gate.wait_scan_finished()).await.unwrap();

        let guard = gate.enter_scan();
        assert!(gate.is_scan_active());
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.wait_scan_finished().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_millis(50), waiter).await.unwrap().unwrap();

        gate.device_disconnected();
        gate.device_disconnected();
    }
}
