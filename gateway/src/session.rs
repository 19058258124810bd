//! Per-device transaction locking, auto-disconnect timers, and connection
//! lifecycle.
//!
//! Grounded on the connect/discoverServices/disconnect and transaction-lock
//! pattern in `BLE_Client.py`'s `BLE_GATT_Connection`: one D-Bus/GATT
//! connection per device, a lock serializing the commands issued against
//! it, and a watchdog that disconnects an idle device after a configurable
//! number of seconds. This gateway is a GATT *client* only: no local GATT
//! server, mesh, rfcomm, or pairing agent support — see [`crate::bluez`] for
//! the concrete D-Bus transport those would have built on. What's kept is
//! the `single_session` idiom: start an activity idempotently, track who's
//! using it, tear it down when the last user is done.

use crate::adapter_trait::{HciAdapter, Peripheral, RawNotification};
use crate::device::{ConnState, Device, DeviceRegistry};
use crate::orchestrator::ExclusionGate;
use crate::{Address, AddressType, Error, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default ATT MTU requested on connect, matching `BLE_GATT_Connection`'s
/// default (`BLEConnection.__init__`'s `mtu=63` keyword).
pub const DEFAULT_MTU: u16 = 63;

/// Default number of connect attempts before giving up, matching
/// `BLE_Client.py`'s default retry count for `connect()`.
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;

struct DeviceSession<A: HciAdapter> {
    lock: Arc<Mutex<()>>,
    peripheral: Mutex<Option<A::Peripheral>>,
    disconnect_timer: Mutex<Option<JoinHandle<()>>>,
    notification_listener: Mutex<Option<JoinHandle<()>>>,
}

impl<A: HciAdapter> Default for DeviceSession<A> {
    fn default() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            peripheral: Mutex::new(None),
            disconnect_timer: Mutex::new(None),
            notification_listener: Mutex::new(None),
        }
    }
}

/// Guard returned by [`SessionManager::begin_transaction`]. Releasing it
/// (drop) wakes the next waiter, FIFO over the underlying
/// [`tokio::sync::Mutex`].
pub struct TransactionGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

/// Serializes connect/discover/read/write/notify/disconnect per device, and
/// drives each device's auto-disconnect watchdog.
///
/// One `SessionManager` is shared across every device; per-device state is
/// allocated lazily in `sessions` on first use, matching
/// `BLE_Client.connections`'s dict-of-connections-by-address.
pub struct SessionManager<A: HciAdapter> {
    adapter: Arc<A>,
    registry: Arc<DeviceRegistry>,
    sessions: Mutex<HashMap<Address, Arc<DeviceSession<A>>>>,
    gate: Option<Arc<ExclusionGate>>,
}

impl<A: HciAdapter + 'static> SessionManager<A> {
    /// Builds a session manager over `adapter`, sharing the given device registry.
    pub fn new(adapter: Arc<A>, registry: Arc<DeviceRegistry>) -> Self {
        Self { adapter, registry, sessions: Mutex::new(HashMap::new()), gate: None }
    }

    /// Attaches the scan/connect [`ExclusionGate`] this manager should notify
    /// around connect/disconnect. Builder-style so
    /// existing two-argument construction sites are unaffected.
    pub fn with_gate(mut self, gate: Arc<ExclusionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    async fn session_for(&self, address: Address) -> Arc<DeviceSession<A>> {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(address).or_default().clone()
    }

    /// Acquires the per-device transaction lock, waiting for any
    /// in-progress transaction to finish first. The orchestrator's
    /// `queue=false` rejection path calls [`SessionManager::is_busy`]
    /// instead of blocking here.
    pub async fn begin_transaction(&self, address: Address) -> TransactionGuard {
        let session = self.session_for(address).await;
        let permit = session.lock.clone().lock_owned().await;
        TransactionGuard { _permit: permit }
    }

    /// Whether a device currently has a transaction in flight, without
    /// waiting to acquire it.
    pub async fn is_busy(&self, address: Address) -> bool {
        let session = self.session_for(address).await;
        session.lock.try_lock().is_err()
    }

    /// Opens a connection to `address`, retrying up to `retries` times on
    /// failure. No-ops (returns `Ok`) if already connected.
    pub async fn connect(&self, address: Address, address_type: AddressType, retries: u32) -> Result<()> {
        if let Some(device) = self.registry.get(address).await {
            if !matches!(device.conn_state, ConnState::Absent) {
                return Err(Error::new(ErrorKind::AlreadyConnected));
            }
        }
        let session = self.session_for(address).await;
        let mut last_err = None;
        for attempt in 0..=retries {
            match self.adapter.connect(address, address_type, DEFAULT_MTU).await {
                Ok(peripheral) => {
                    *session.peripheral.lock().await = Some(peripheral);
                    self.registry.with_mut(address, |d| d.conn_state = ConnState::Connected).await;
                    if let Some(gate) = &self.gate {
                        gate.device_connected();
                    }
                    return Ok(());
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt + 1 <= retries {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::new(ErrorKind::ConnectFailed)))
    }

    /// Discovers services (optionally scoped to one), populating
    /// `Device::services`. Requires the device to be connected.
    pub async fn discover(&self, address: Address, populate: impl FnOnce(&mut Device, Vec<crate::adapter_trait::DiscoveredService>) + Send) -> Result<()> {
        let session = self.session_for(address).await;
        let peripheral_guard = session.peripheral.lock().await;
        let peripheral = peripheral_guard.as_ref().ok_or_else(|| Error::new(ErrorKind::WrongState))?;
        let services = peripheral.discover_services().await?;
        drop(peripheral_guard);
        self.registry
            .with_mut(address, |d| {
                populate(d, services);
                d.conn_state = ConnState::Discovered;
            })
            .await
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        Ok(())
    }

    /// Returns a reference-counted handle to the device's open peripheral,
    /// for read/write/notify calls. `None` if not connected.
    pub async fn peripheral(&self, address: Address) -> Option<Arc<DeviceSession<A>>> {
        let session = self.session_for(address).await;
        let has_peripheral = session.peripheral.lock().await.is_some();
        has_peripheral.then_some(session)
    }

    /// Runs `op` against the device's open peripheral.
    pub async fn with_peripheral<R>(&self, address: Address, op: impl FnOnce(&A::Peripheral) -> futures::future::BoxFuture<'_, Result<R>>) -> Result<R> {
        let session = self.session_for(address).await;
        let guard = session.peripheral.lock().await;
        let peripheral = guard.as_ref().ok_or_else(|| Error::new(ErrorKind::WrongState))?;
        op(peripheral).await
    }

    /// Tears down the connection: cancels the disconnect timer, stops any
    /// notification listener, closes the peripheral, and marks the device
    /// absent.
    ///
    /// The notification listener is joined *outside* the transaction lock:
    /// the listener itself never needs the transaction lock to deliver a
    /// notification, so holding the lock while joining it would be a
    /// needless opportunity for deadlock against a concurrent read/write.
    pub async fn disconnect(&self, address: Address) -> Result<()> {
        self.registry.with_mut(address, |d| d.conn_state = ConnState::TearingDown).await;
        let session = self.session_for(address).await;
        self.cancel_disconnect_timer(address).await;

        let listener = session.notification_listener.lock().await.take();
        if let Some(handle) = listener {
            handle.abort();
            let _ = handle.await;
        }

        let peripheral = session.peripheral.lock().await.take();
        let had_peripheral = peripheral.is_some();
        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await?;
        }
        self.registry.with_mut(address, |d| d.conn_state = ConnState::Absent).await;
        if had_peripheral {
            if let Some(gate) = &self.gate {
                gate.device_disconnected();
            }
        }
        Ok(())
    }

    /// (Re-)arms the auto-disconnect watchdog: disconnects the device after
    /// `after` of inactivity unless canceled or re-armed first. Idempotent —
    /// calling this again replaces any previously scheduled timer.
    pub async fn arm_disconnect_timer(self: &Arc<Self>, address: Address, after: Duration)
    where
        A: Send + Sync,
    {
        let session = self.session_for(address).await;
        let mut slot = session.disconnect_timer.lock().await;
        if let Some(existing) = slot.take() {
            existing.abort();
        }
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = manager.disconnect(address).await;
        }));
    }

    /// Cancels a previously armed auto-disconnect timer, if any.
    pub async fn cancel_disconnect_timer(&self, address: Address) {
        let session = self.session_for(address).await;
        if let Some(handle) = session.disconnect_timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Starts (or replaces) the background task delivering notifications
    /// for `address` to `on_notification`, by polling
    /// [`Peripheral::wait_for_notification`] in a loop.
    pub fn start_notification_listener(self: &Arc<Self>, address: Address, on_notification: impl Fn(RawNotification) + Send + Sync + 'static)
    where
        A: Send + Sync,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            let session = manager.session_for(address).await;
            loop {
                let notification = {
                    let guard = session.peripheral.lock().await;
                    match guard.as_ref() {
                        Some(peripheral) => peripheral.wait_for_notification(Duration::from_secs(5)).await,
                        None => break,
                    }
                };
                match notification {
                    Ok(Some(n)) => on_notification(n),
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::RawAdvertisement;
    use crate::adapter_trait::{DiscoveredService, RawValue, ScanEntry};
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct FakePeripheral;

    #[async_trait]
    impl Peripheral for FakePeripheral {
        async fn discover_services(&self) -> Result<Vec<DiscoveredService>> {
            Ok(Vec::new())
        }
        async fn read(&self, _handle: u16) -> Result<RawValue> {
            Ok(Vec::new())
        }
        async fn write(&self, _handle: u16, _value: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn wait_for_notification(&self, _timeout: Duration) -> Result<Option<RawNotification>> {
            Ok(None)
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeAdapter {
        fail_connects: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl HciAdapter for FakeAdapter {
        type Peripheral = FakePeripheral;

        async fn discover(&self) -> Result<BoxStream<'static, ScanEntry>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn connect(&self, _address: Address, _address_type: AddressType, _mtu: u16) -> Result<Self::Peripheral> {
            if self.fail_connects.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(Error::new(ErrorKind::ConnectFailed));
            }
            Ok(FakePeripheral)
        }

        fn interface_name(&self) -> &str {
            "hci0"
        }
    }

    fn blank_ad() -> RawAdvertisement {
        RawAdvertisement { structures: Vec::new() }
    }

    #[tokio::test]
    async fn connect_succeeds_and_marks_device_connected() {
        let adapter = Arc::new(FakeAdapter { fail_connects: std::sync::atomic::AtomicU32::new(0) });
        let registry = Arc::new(DeviceRegistry::new());
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let ad = crate::ad::AdParser::parse(&blank_ad()).unwrap();
        let decoders = crate::ad::PayloadDecoderRegistry::new();
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;

        let manager = SessionManager::new(adapter, registry.clone());
        manager.connect(addr, AddressType::LePublic, DEFAULT_CONNECT_RETRIES).await.unwrap();
        assert_eq!(registry.get(addr).await.unwrap().conn_state, ConnState::Connected);
    }

    #[tokio::test]
    async fn connect_retries_until_it_succeeds() {
        let adapter = Arc::new(FakeAdapter { fail_connects: std::sync::atomic::AtomicU32::new(2) });
        let registry = Arc::new(DeviceRegistry::new());
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let ad = crate::ad::AdParser::parse(&blank_ad()).unwrap();
        let decoders = crate::ad::PayloadDecoderRegistry::new();
        registry.upsert(addr, AddressType::LePublic, Some(-50), true, &ad, &decoders).await;

        let manager = SessionManager::new(adapter, registry);
        manager.connect(addr, AddressType::LePublic, 3).await.unwrap();
    }

    #[tokio::test]
    async fn second_transaction_waits_for_the_first_to_release() {
        let adapter = Arc::new(FakeAdapter { fail_connects: std::sync::atomic::AtomicU32::new(0) });
        let registry = Arc::new(DeviceRegistry::new());
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        let manager = Arc::new(SessionManager::new(adapter, registry));

        assert!(!manager.is_busy(addr).await);
        let guard = manager.begin_transaction(addr).await;
        assert!(manager.is_busy(addr).await);
        drop(guard);
        assert!(!manager.is_busy(addr).await);
    }
}
