//! Throttled, panic-isolated callback invocation.
//!
//! Grounded on `BLE_Device_Delegate.handleDiscovery`/`scanEnded` in the
//! Python original: user-supplied callbacks are plain functions invoked
//! directly from the scan worker, with a per-device "don't report more than
//! once every N seconds" throttle and a blanket try/except around the call
//! so a broken callback never kills the scan loop. The capability set below
//! (`on_advertisement`/`on_scan_end`/`on_notification`) replaces the
//! original's single polymorphic delegate object — no base class needed, a
//! struct of optional closures covers the same three hook points.

use crate::device::Device;
use crate::message::{AdvertisementEvent, GattResultEvent, ScanResultEvent};
use crate::Address;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The capability set a caller registers to observe gateway events.
///
/// Any hook left `None` is simply never invoked; this is the Rust
/// replacement for the original's duck-typed delegate object, which only
/// needed to define the methods it cared about.
#[derive(Default)]
pub struct ScanDelegate {
    /// Invoked once per (throttled) advertisement report.
    pub on_advertisement: Option<Box<dyn Fn(&Device, &AdvertisementEvent) + Send + Sync>>,
    /// Invoked once when a scan cycle ends.
    pub on_scan_end: Option<Box<dyn Fn(&ScanResultEvent) + Send + Sync>>,
    /// Invoked for every GATT command result and notification delivery.
    pub on_notification: Option<Box<dyn Fn(Address, &GattResultEvent) + Send + Sync>>,
}

/// Invokes [`ScanDelegate`] hooks with per-device throttling and panic
/// isolation.
///
/// One dispatcher is shared by the scan worker and the GATT notification
/// workers. `adv_report_interval` implements the `advertisementCallback`
/// throttle: `0` delivers every advertisement, a
/// positive value delivers at most one callback per device per that many
/// seconds. The throttle state lives here (keyed by address) rather than on
/// [`Device`] because it tracks *callback delivery*, not device state, and
/// must survive a scan-start registry clear without resetting.
pub struct CallbackDispatcher {
    delegate: ScanDelegate,
    adv_report_interval: Mutex<Duration>,
    last_report: Mutex<HashMap<Address, Instant>>,
}

impl CallbackDispatcher {
    /// Builds a dispatcher around the given hook set, initially reporting
    /// every advertisement (`adv_interval = 0`).
    pub fn new(delegate: ScanDelegate) -> Self {
        Self { delegate, adv_report_interval: Mutex::new(Duration::ZERO), last_report: Mutex::new(HashMap::new()) }
    }

    /// Sets the minimum interval between advertisement callbacks for the
    /// same device. Takes effect for subsequent reports; does not retroactively
    /// reset any device's throttle clock.
    pub fn set_adv_report_interval(&self, interval: Duration) {
        *self.adv_report_interval.lock().unwrap() = interval;
    }

    /// Reports an advertisement, subject to the per-device throttle.
    /// Returns whether the callback actually fired (useful for tests and for
    /// the scan summary's "detected vs reported" bookkeeping, if ever split
    /// out from "detected vs accepted").
    pub fn report_advertisement(&self, address: Address, device: &Device, event: &AdvertisementEvent) -> bool {
        let interval = *self.adv_report_interval.lock().unwrap();
        if interval > Duration::ZERO {
            let mut last = self.last_report.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = last.get(&address) {
                if now.duration_since(*prev) < interval {
                    return false;
                }
            }
            last.insert(address, now);
        }
        if let Some(cb) = &self.delegate.on_advertisement {
            isolate(|| cb(device, event));
        }
        true
    }

    /// Reports a scan-end summary. Never throttled.
    pub fn report_scan_end(&self, event: &ScanResultEvent) {
        if let Some(cb) = &self.delegate.on_scan_end {
            isolate(|| cb(event));
        }
    }

    /// Reports a GATT command result or notification delivery. Never
    /// throttled: every GATT command is total and must always reach the
    /// caller.
    pub fn report_gatt_result(&self, address: Address, event: &GattResultEvent) {
        if let Some(cb) = &self.delegate.on_notification {
            isolate(|| cb(address, event));
        }
    }

    /// Clears per-device throttle state. Called at scan start alongside
    /// `DeviceRegistry::clear` so a device's report clock restarts with its
    /// record.
    pub fn reset_throttle(&self) {
        self.last_report.lock().unwrap().clear();
    }
}

/// Runs `f`, catching (and logging) any panic so a broken user callback
/// never propagates into the scan or notification worker that invoked it.
///
/// Mirrors the original's blanket `except Exception: log.exception(...)`
/// around every delegate call: a user callback panicking must never
/// propagate into the worker that invoked it.
fn isolate(f: impl FnOnce() + std::panic::UnwindSafe) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::error!("user callback panicked: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::BeaconKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn blank_device(address: Address) -> Device {
        Device::from_scan_data(
            address,
            crate::AddressType::LePublic,
            Some(-50),
            true,
            &crate::ad::AdvertisementRecord {
                local_name: None,
                flags: None,
                service_uuids: Vec::new(),
                service_data: Default::default(),
                manufacturer_id: None,
                manufacturer_data: Vec::new(),
                kind: BeaconKind::Standard,
            },
            &crate::ad::PayloadDecoderRegistry::new(),
        )
    }

    fn blank_event(address: Address) -> AdvertisementEvent {
        AdvertisementEvent {
            address,
            name: None,
            rssi: Some(-50),
            max_rssi: Some(-50),
            connectable: true,
            flags: None,
            service_data: serde_json::Map::new(),
            manufacturer_id: None,
            manufacturer_data: None,
            manufacturer_name: None,
            manufacturer_value: None,
            kind: "standard",
        }
    }

    #[test]
    fn zero_interval_reports_every_advertisement() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let dispatcher = CallbackDispatcher::new(ScanDelegate {
            on_advertisement: Some(Box::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        let addr = Address::any();
        let device = blank_device(addr);
        for _ in 0..5 {
            assert!(dispatcher.report_advertisement(addr, &device, &blank_event(addr)));
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn positive_interval_throttles_repeated_reports() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let dispatcher = CallbackDispatcher::new(ScanDelegate {
            on_advertisement: Some(Box::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        dispatcher.set_adv_report_interval(Duration::from_secs(60));
        let addr = Address::any();
        let device = blank_device(addr);
        assert!(dispatcher.report_advertisement(addr, &device, &blank_event(addr)));
        assert!(!dispatcher.report_advertisement(addr, &device, &blank_event(addr)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let dispatcher = CallbackDispatcher::new(ScanDelegate {
            on_scan_end: Some(Box::new(|_| panic!("boom"))),
            ..Default::default()
        });
        dispatcher.report_scan_end(&ScanResultEvent { timestamp: 0, error: 0, dev_detected: 0, dev_selected: 0, devices: None });
    }
}
