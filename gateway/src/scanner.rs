//! Scan-loop driving in synchronous, asynchronous, indefinite and periodic
//! modes.
//!
//! Grounded on `BLE_Client.scan`/`scan_async`/`scan_periodic` in the Python
//! original, which wrap a `bluepy` `Scanner` object running on a worker
//! thread; the worker here is a `tokio` task driving the
//! [`crate::adapter_trait::HciAdapter::discover`] stream instead.

use crate::adapter_trait::HciAdapter;
use crate::ad::{AdParser, PayloadDecoderRegistry};
use crate::device::DeviceRegistry;
use crate::dispatch::CallbackDispatcher;
use crate::filter::FilterChain;
use crate::message::{AdvertisementEvent, AdvertisementMode, ScanResultEvent};
use crate::orchestrator::ExclusionGate;
use crate::session::SessionManager;
use crate::{Address, Error, Result};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant as TokioInstant;

/// Outcome of one completed scan cycle, independent of how much detail the
/// originating command asked to publish.
#[derive(Clone, Debug, Default)]
pub struct ScanOutcome {
    /// Total advertisements observed.
    pub detected: usize,
    /// Advertisements admitted by the active [`FilterChain`].
    pub accepted: usize,
    /// `0` on a clean stop/timeout; nonzero mirrors an adapter-level fault.
    pub error: i32,
}

struct RunningScan {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<ScanOutcome>,
}

/// Drives the adapter's scan loop in its four public modes (synchronous,
/// asynchronous, indefinite, periodic), enforcing the scan/connect exclusion
/// discipline before every variant and publishing per-advertisement and
/// scan-end events through a shared [`CallbackDispatcher`].
pub struct Scanner<A: HciAdapter> {
    adapter: Arc<A>,
    registry: Arc<DeviceRegistry>,
    filters: Arc<Mutex<FilterChain>>,
    dispatcher: Arc<CallbackDispatcher>,
    sessions: Arc<SessionManager<A>>,
    gate: Arc<ExclusionGate>,
    decoders: Arc<PayloadDecoderRegistry>,
    running: Mutex<Option<RunningScan>>,
}

impl<A: HciAdapter + 'static> Scanner<A> {
    /// Builds a scanner sharing state with the rest of the gateway, with only
    /// the built-in GATT Assigned-Number service-data decoders registered.
    /// Use [`Scanner::with_decoders`] to supply vendor decoders as well.
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<DeviceRegistry>,
        filters: Arc<Mutex<FilterChain>>,
        dispatcher: Arc<CallbackDispatcher>,
        sessions: Arc<SessionManager<A>>,
        gate: Arc<ExclusionGate>,
    ) -> Self {
        Self { adapter, registry, filters, dispatcher, sessions, gate, decoders: Arc::new(PayloadDecoderRegistry::new()), running: Mutex::new(None) }
    }

    /// Replaces the service-data decoder registry, e.g. with vendor
    /// decoders registered under the manufacturer-ID namespace.
    pub fn with_decoders(mut self, decoders: Arc<PayloadDecoderRegistry>) -> Self {
        self.decoders = decoders;
        self
    }

    /// Runs one scan cycle of `timeout`, blocking the caller until it ends.
    ///
    /// `inhibit_filters_and_callbacks` skips the
    /// `FilterChain` (every device is accepted) and the `CallbackDispatcher`
    /// (no per-advertisement or scan-end callbacks fire) — used for a silent
    /// one-shot census of the radio environment.
    pub async fn scan_sync(&self, timeout: Duration, force_disconnect: bool, inhibit_filters_and_callbacks: bool) -> Result<ScanOutcome> {
        self.enter_exclusion(force_disconnect).await?;
        let outcome = self.run_once(Some(timeout), inhibit_filters_and_callbacks).await?;
        if !inhibit_filters_and_callbacks {
            self.publish_scan_end(&outcome).await;
        }
        Ok(outcome)
    }

    /// Starts a timed scan on a background task, returning once it has
    /// actually started. Await completion with [`Scanner::scan_wait`].
    pub async fn scan_async(self: &Arc<Self>, timeout: Duration, force_disconnect: bool) -> Result<()> {
        self.start_background(Some(timeout), force_disconnect, false).await
    }

    /// Starts an event-driven scan with no timeout; ends only on
    /// [`Scanner::stop`] or a non-recoverable adapter error.
    pub async fn scan_indefinite(self: &Arc<Self>, force_disconnect: bool) -> Result<()> {
        self.start_background(None, force_disconnect, false).await
    }

    /// Alternates `scan_async(timeout)` cycles with a `breath =
    /// max(0, period - timeout)` idle, re-arming after every scan-end until
    /// [`Scanner::stop`] is called or a cycle reports a non-recoverable
    /// error.
    pub async fn scan_periodic(self: &Arc<Self>, timeout: Duration, period: Duration) -> Result<()> {
        self.start_background(Some(timeout), false, true).await?;
        let breath = period.saturating_sub(timeout);
        let scanner = self.clone();
        // `start_background` already spawned the first cycle; the periodic
        // re-arm loop lives in its own task so `scan_periodic` itself
        // returns as soon as the first cycle has started, matching
        // `scan_async`'s "returns once started" contract.
        tokio::spawn(async move {
            loop {
                // Wait for the in-flight cycle to end (timeout or explicit stop).
                let running = scanner.running.lock().await.take();
                let Some(running) = running else { return };
                let _ = running.join.await;
                if running.stopped.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(breath).await;
                if scanner.start_background(Some(timeout), false, true).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    /// Signals the currently running scan (any mode) to stop at the next
    /// poll boundary and waits for it to end.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.stopped.store(true, Ordering::SeqCst);
            running.stop.notify_waiters();
            let _ = running.join.await;
        }
    }

    /// Blocks until the currently running background scan ends, if any.
    ///
    /// Takes the running-scan slot so a second concurrent waiter simply sees
    /// nothing left to wait on, rather than blocking forever on a handle
    /// someone else already consumed.
    pub async fn scan_wait(&self) {
        let taken = self.running.lock().await.take();
        if let Some(running) = taken {
            let _ = running.join.await;
        }
    }

    async fn enter_exclusion(&self, force_disconnect: bool) -> Result<()> {
        if force_disconnect {
            let devices = self.registry.all().await;
            for device in devices {
                if !matches!(device.conn_state, crate::device::ConnState::Absent) {
                    let _ = self.sessions.disconnect(device.address).await;
                }
            }
        }
        self.gate.wait_idle().await;
        Ok(())
    }

    async fn start_background(self: &Arc<Self>, timeout: Option<Duration>, force_disconnect: bool, _part_of_periodic: bool) -> Result<()> {
        self.enter_exclusion(force_disconnect).await?;
        let (started_tx, started_rx) = oneshot::channel();
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let scanner = self.clone();
        let stop_for_task = stop.clone();
        let stopped_for_task = stopped.clone();
        let join = tokio::spawn(async move {
            let outcome = scanner
                .run_with_stop(timeout, stop_for_task, stopped_for_task, false, Some(started_tx))
                .await
                .unwrap_or(ScanOutcome { error: crate::error_code::TRANSPORT_EXCEPTION, ..Default::default() });
            scanner.publish_scan_end(&outcome).await;
            outcome
        });
        *self.running.lock().await = Some(RunningScan { stop, stopped, join });
        // Resolves once `run_with_stop` has actually started the adapter's
        // discovery stream (or failed trying), matching §4.5's
        // "returns once the scan has actually started" contract.
        let _ = started_rx.await;
        Ok(())
    }

    async fn run_once(&self, timeout: Option<Duration>, inhibit: bool) -> Result<ScanOutcome> {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        self.run_with_stop(timeout, stop, stopped, inhibit, None).await
    }

    async fn run_with_stop(
        &self,
        timeout: Option<Duration>,
        stop: Arc<Notify>,
        stopped: Arc<AtomicBool>,
        inhibit: bool,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<ScanOutcome> {
        self.registry.clear().await;
        if !inhibit {
            self.dispatcher.reset_throttle();
        }
        // Held until this function returns by any path, so a GATT command
        // racing a just-finished `enter_exclusion` wait still sees the radio
        // as busy for as long as discovery is actually open.
        let _scan_guard = self.gate.enter_scan();
        let mut stream = self.adapter.discover().await?;
        if let Some(started) = started {
            let _ = started.send(());
        }
        let mut detected = 0usize;
        let mut accepted = 0usize;
        let deadline = timeout.map(|t| TokioInstant::now() + t);

        loop {
            let next = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, stream.next()).await.ok().flatten(),
                    None => stream.next().await,
                }
            };
            tokio::select! {
                biased;
                _ = stop.notified() => break,
                entry = next => {
                    let Some(entry) = entry else { break };
                    detected += 1;
                    if self.handle_entry(entry, inhibit).await {
                        accepted += 1;
                    }
                    if let Some(deadline) = deadline {
                        if TokioInstant::now() >= deadline {
                            break;
                        }
                    }
                }
            }
            if stopped.load(Ordering::SeqCst) {
                break;
            }
        }
        drop(stream);

        Ok(ScanOutcome { detected, accepted, error: 0 })
    }

    /// Parses, filters and registers one discovery event, reporting it
    /// through the dispatcher when accepted. Returns whether it was
    /// (newly or retroactively) accepted.
    async fn handle_entry(&self, entry: crate::adapter_trait::ScanEntry, inhibit: bool) -> bool {
        let ad = match AdParser::parse(&entry.advertisement) {
            Ok(ad) => ad,
            Err(err) => {
                log::warn!("dropping malformed advertisement from {}: {err}", entry.address);
                return false;
            }
        };

        let filters = self.filters.lock().await;
        let accept = inhibit || filters.accept(&ad, entry.rssi, entry.connectable, entry.address);
        let reconsider = !accept && filters.has_rssi_filter() && filters.accepts_ignoring_rssi(&ad, entry.connectable, entry.address);
        let known = self.registry.get(entry.address).await.is_some();
        drop(filters);

        if !accept && !reconsider && !known {
            return false;
        }

        self.registry.upsert(entry.address, entry.address_type, entry.rssi, entry.connectable, &ad, &self.decoders).await;

        if inhibit {
            return true;
        }

        let Some(device) = self.registry.get(entry.address).await else { return false };
        let event = advertisement_event(&device);
        self.dispatcher.report_advertisement(entry.address, &device, &event);
        true
    }

    async fn publish_scan_end(&self, outcome: &ScanOutcome) {
        let event = ScanResultEvent {
            timestamp: unix_timestamp(),
            error: outcome.error,
            dev_detected: outcome.detected,
            dev_selected: outcome.accepted,
            devices: None,
        };
        self.dispatcher.report_scan_end(&event);
    }
}

/// Builds the outbound advertisement payload for one device snapshot.
pub(crate) fn advertisement_event(device: &crate::device::Device) -> AdvertisementEvent {
    use crate::ad::BeaconKind;
    let kind = match device.kind {
        BeaconKind::Standard => "standard",
        BeaconKind::Eddystone(_) => "eddystone",
        BeaconKind::IBeacon(_) => "ibeacon",
    };
    let mut service_data = serde_json::Map::new();
    for (uuid, datum) in &device.service_data {
        let key = datum.name.map(str::to_string).unwrap_or_else(|| format!("{uuid:04x}"));
        service_data.insert(key, decoded_value_json(&datum.value));
    }
    AdvertisementEvent {
        address: device.address,
        name: device.local_name.clone(),
        rssi: device.last_rssi,
        max_rssi: device.max_rssi,
        connectable: device.connectable,
        flags: device.flags,
        service_data,
        manufacturer_id: device.manufacturer_id,
        manufacturer_data: (!device.manufacturer_data.is_empty()).then(|| hex::encode(&device.manufacturer_data)),
        manufacturer_name: device.manufacturer_decoder,
        manufacturer_value: device.manufacturer_value.as_ref().map(decoded_value_json),
        kind,
    }
}

fn decoded_value_json(value: &crate::ad::DecodedValue) -> serde_json::Value {
    use crate::ad::DecodedValue;
    match value {
        DecodedValue::Int(n) => serde_json::json!(n),
        DecodedValue::Float(f) => serde_json::json!(f),
        DecodedValue::Str(s) => serde_json::json!(s),
        DecodedValue::Bytes(b) => serde_json::json!(hex::encode(b)),
        DecodedValue::Composite(fields) => {
            let mut map = serde_json::Map::new();
            for (name, value) in fields {
                map.insert((*name).to_string(), decoded_value_json(value));
            }
            serde_json::Value::Object(map)
        }
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Maps a transport error raised mid-scan to the `scan_result` error field.
pub fn scan_error_code(_err: &Error) -> i32 {
    crate::error_code::TRANSPORT_EXCEPTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::RawAdvertisement;
    use crate::adapter_trait::{DiscoveredService, Peripheral, RawNotification, RawValue, ScanEntry};
    use crate::dispatch::ScanDelegate;
    use crate::{AddressType, Result as GwResult};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::AtomicUsize;

    struct FakePeripheral;
    #[async_trait]
    impl Peripheral for FakePeripheral {
        async fn discover_services(&self) -> GwResult<Vec<DiscoveredService>> {
            Ok(Vec::new())
        }
        async fn read(&self, _handle: u16) -> GwResult<RawValue> {
            Ok(Vec::new())
        }
        async fn write(&self, _handle: u16, _value: &[u8]) -> GwResult<()> {
            Ok(())
        }
        async fn wait_for_notification(&self, _timeout: Duration) -> GwResult<Option<RawNotification>> {
            Ok(None)
        }
        async fn disconnect(&self) -> GwResult<()> {
            Ok(())
        }
    }

    struct FakeAdapter {
        entries: Vec<ScanEntry>,
    }

    #[async_trait]
    impl HciAdapter for FakeAdapter {
        type Peripheral = FakePeripheral;

        async fn discover(&self) -> GwResult<BoxStream<'static, ScanEntry>> {
            Ok(Box::pin(futures::stream::iter(self.entries.clone())))
        }

        async fn connect(&self, _address: Address, _address_type: AddressType, _mtu: u16) -> GwResult<Self::Peripheral> {
            Ok(FakePeripheral)
        }

        fn interface_name(&self) -> &str {
            "hci0"
        }
    }

    fn entry(addr: [u8; 6], rssi: i16) -> ScanEntry {
        ScanEntry {
            address: Address::new(addr),
            address_type: AddressType::LePublic,
            rssi: Some(rssi),
            connectable: true,
            advertisement: RawAdvertisement { structures: Vec::new() },
        }
    }

    fn make_scanner(entries: Vec<ScanEntry>) -> Arc<Scanner<FakeAdapter>> {
        let adapter = Arc::new(FakeAdapter { entries });
        let registry = Arc::new(DeviceRegistry::new());
        let filters = Arc::new(Mutex::new(FilterChain::new()));
        let dispatcher = Arc::new(CallbackDispatcher::new(ScanDelegate::default()));
        let sessions = Arc::new(SessionManager::new(adapter.clone(), registry.clone()));
        let gate = Arc::new(ExclusionGate::new());
        Arc::new(Scanner::new(adapter, registry, filters, dispatcher, sessions, gate))
    }

    #[tokio::test]
    async fn scan_sync_counts_detected_and_accepted() {
        let scanner = make_scanner(vec![entry([1, 2, 3, 4, 5, 6], -40), entry([1, 2, 3, 4, 5, 7], -90)]);
        let outcome = scanner.scan_sync(Duration::from_millis(50), false, false).await.unwrap();
        assert_eq!(outcome.detected, 2);
        assert_eq!(outcome.accepted, 2);
    }

    #[tokio::test]
    async fn scan_sync_applies_active_filters() {
        let scanner = make_scanner(vec![entry([1, 2, 3, 4, 5, 6], -40), entry([1, 2, 3, 4, 5, 7], -90)]);
        scanner.filters.lock().await.push(crate::filter::Filter::Rssi(-60));
        let outcome = scanner.scan_sync(Duration::from_millis(50), false, false).await.unwrap();
        assert_eq!(outcome.detected, 2);
        assert_eq!(outcome.accepted, 1);
    }

    #[tokio::test]
    async fn inhibit_flag_skips_filters_and_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let adapter = Arc::new(FakeAdapter { entries: vec![entry([1, 2, 3, 4, 5, 6], -90)] });
        let registry = Arc::new(DeviceRegistry::new());
        let filters = Arc::new(Mutex::new({
            let mut f = FilterChain::new();
            f.push(crate::filter::Filter::Rssi(-10));
            f
        }));
        let dispatcher = Arc::new(CallbackDispatcher::new(ScanDelegate {
            on_advertisement: Some(Box::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        }));
        let sessions = Arc::new(SessionManager::new(adapter.clone(), registry.clone()));
        let gate = Arc::new(ExclusionGate::new());
        let scanner = Arc::new(Scanner::new(adapter, registry, filters, dispatcher, sessions, gate));

        let outcome = scanner.scan_sync(Duration::from_millis(20), false, true).await.unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
