//! The four command-facing GATT primitives:
//! `read_characteristics`, `write_characteristics`, `allow_notifications`
//! and `discover`. Each composes [`super::GattOps`]'s per-characteristic
//! read/write/notify-enable over [`crate::session::SessionManager`],
//! connecting and discovering services lazily and arming the post-operation
//! auto-disconnect timer (`keep`) on the way out.
//!
//! Grounded on `BLE_Client.read_characteristics`/`write_characteristics`/
//! `allow_notifications`/`discover` in the Python original, which perform
//! exactly this connect-if-needed / discover-if-needed / operate / re-arm
//! sequence around a single device lock.

use super::{resolve_characteristic, GattOps};
use crate::adapter_trait::{DiscoveredCharacteristic, DiscoveredService, HciAdapter, RawNotification};
use crate::device::{Channel, ConnState, Device, DeviceRegistry, Service};
use crate::message::{GattActionSpec, GattResultValue};
use crate::session::{SessionManager, DEFAULT_CONNECT_RETRIES};
use crate::{error_code, Address, AddressType, Error, ErrorKind, Result, UuidExt};
use std::sync::Arc;
use std::time::Duration;

/// Default `keep` applied to `allow_notifications` when the caller omits it
/// or sends a non-positive value — unlike `read`/`write`/`discover`, where a
/// non-positive `keep` means "disconnect immediately", a subscription with
/// no stated lifetime defaults to 10 seconds so the first notification has a
/// chance to arrive.
pub const DEFAULT_NOTIFY_KEEP_SECS: i64 = 10;

/// Connects to `address` if it isn't already connected or connected, no-op
/// otherwise. `address_type` is read from the device registry when the
/// device is already known from a scan; callers targeting a device that was
/// never scanned must supply it via the same registry entry beforehand.
pub async fn ensure_connected<A: HciAdapter + 'static>(
    sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address, address_type: AddressType,
) -> Result<()> {
    let state = registry.get(address).await.map(|d| d.conn_state).unwrap_or(ConnState::Absent);
    match state {
        ConnState::Absent => sessions.connect(address, address_type, DEFAULT_CONNECT_RETRIES).await,
        ConnState::Connected | ConnState::Discovered => Ok(()),
        ConnState::TearingDown => Err(Error::new(ErrorKind::WrongState)),
    }
}

/// Discovers services if they haven't been discovered yet on this
/// connection. A failure here is fatal to the connection per §4.6: the
/// caller must disconnect rather than retry in place.
pub async fn ensure_discovered<A: HciAdapter + 'static>(sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address) -> Result<()> {
    let state = registry.get(address).await.map(|d| d.conn_state).unwrap_or(ConnState::Absent);
    if state == ConnState::Discovered {
        return Ok(());
    }
    match sessions.discover(address, populate_services).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = sessions.disconnect(address).await;
            Err(err)
        }
    }
}

fn populate_services(device: &mut Device, discovered: Vec<DiscoveredService>) {
    device.services = discovered.into_iter().map(convert_service).collect();
}

fn convert_service(service: DiscoveredService) -> Service {
    Service {
        uuid: service.uuid,
        primary: service.primary,
        channels: service.characteristics.into_iter().map(convert_channel).collect(),
    }
}

fn convert_channel(characteristic: DiscoveredCharacteristic) -> Channel {
    Channel {
        uuid: characteristic.uuid,
        handle: characteristic.handle,
        value_type: super::ValueType::Raw,
        readable: characteristic.readable,
        writable: characteristic.writable,
        notifiable: characteristic.notifiable,
        cccd_handle: characteristic.cccd_handle,
    }
}

/// Translates a `keep` field to the post-operation auto-disconnect policy:
/// `None` means disconnect immediately, `Some(d)` arms the timer for `d`.
fn keep_to_policy(keep: Option<i64>, default_on_non_positive: Option<Duration>) -> Option<Duration> {
    match keep {
        Some(k) if k > 0 => Some(Duration::from_secs(k as u64)),
        _ => default_on_non_positive,
    }
}

async fn apply_keep<A: HciAdapter + 'static>(sessions: &Arc<SessionManager<A>>, address: Address, policy: Option<Duration>) {
    match policy {
        Some(duration) => sessions.arm_disconnect_timer(address, duration).await,
        None => {
            let _ = sessions.disconnect(address).await;
        }
    }
}

/// Reads one or more characteristics, coercing each to its declared type.
///
/// Non-existent characteristics are logged and skipped, not fatal to the
/// batch. A read that fails because the underlying connection is gone
/// aborts the remaining actions; any other per-action failure is logged and
/// that action is simply omitted from the result.
pub async fn read_characteristics<A: HciAdapter + 'static>(
    sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address, address_type: AddressType, actions: &[GattActionSpec], keep: Option<i64>,
) -> Result<Vec<GattResultValue>> {
    let _txn = sessions.begin_transaction(address).await;
    ensure_connected(sessions, registry, address, address_type).await?;
    ensure_discovered(sessions, registry, address).await?;

    let mut values = Vec::new();
    for action in actions {
        let device = registry.get(address).await.ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let mut channel = match resolve_characteristic(&device, None, &action.characteristic) {
            Ok(channel) => channel.clone(),
            Err(_) => {
                log::warn!("gatt read: characteristic {} not found on {address}, skipping", action.characteristic);
                continue;
            }
        };
        // The discovered handle table never learns an application-level type
        // (BlueZ hands back raw bytes); the action's declared `type` is
        // authoritative for how this read gets coerced.
        channel.value_type = super::ValueType::from_code(action.value_type.unwrap_or(0))?;
        let result = sessions
            .with_peripheral(address, move |peripheral| Box::pin(async move { GattOps::read(peripheral, &channel).await }))
            .await;
        match result {
            Ok(value) => values.push(GattResultValue { characteristic: action.characteristic.clone(), value_type: action.value_type.unwrap_or(0), value }),
            Err(err) if is_connection_lost(&err) => {
                apply_keep(sessions, address, keep_to_policy(keep, None)).await;
                return Err(err);
            }
            Err(err) => log::warn!("gatt read of {} on {address} failed: {err}", action.characteristic),
        }
    }

    apply_keep(sessions, address, keep_to_policy(keep, None)).await;
    Ok(values)
}

/// Writes one or more characteristics. Unlike `read`, a write failure aborts
/// the remaining actions in the batch — the connection is likely impaired.
pub async fn write_characteristics<A: HciAdapter + 'static>(
    sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address, address_type: AddressType, actions: &[GattActionSpec], keep: Option<i64>,
) -> Result<()> {
    let _txn = sessions.begin_transaction(address).await;
    ensure_connected(sessions, registry, address, address_type).await?;
    ensure_discovered(sessions, registry, address).await?;

    for action in actions {
        let device = registry.get(address).await.ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let mut channel = resolve_characteristic(&device, None, &action.characteristic)?.clone();
        channel.value_type = super::ValueType::from_code(action.value_type.unwrap_or(0))?;
        let value = action.value.clone().ok_or_else(|| Error::with_message(ErrorKind::BadCommand("write action missing value".into()), action.characteristic.clone()))?;
        let result = sessions
            .with_peripheral(address, move |peripheral| Box::pin(async move { GattOps::write(peripheral, &channel, &value).await }))
            .await;
        if let Err(err) = result {
            apply_keep(sessions, address, keep_to_policy(keep, None)).await;
            return Err(err);
        }
    }

    apply_keep(sessions, address, keep_to_policy(keep, None)).await;
    Ok(())
}

/// Enables notifications on one or more characteristics, writing each
/// action's carried `value` *after* the CCCD write per §4.7, and starts the
/// device's notification listener on first subscription. `on_notification`
/// is invoked from the listener task for every delivery; the caller wires
/// it to message-bus publication.
pub async fn allow_notifications<A: HciAdapter + 'static>(
    sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address, address_type: AddressType, actions: &[GattActionSpec], keep: Option<i64>,
    on_notification: impl Fn(Address, RawNotification) + Send + Sync + 'static,
) -> Result<()> {
    let _txn = sessions.begin_transaction(address).await;
    ensure_connected(sessions, registry, address, address_type).await?;
    ensure_discovered(sessions, registry, address).await?;

    let mut subscribed_any = false;
    for action in actions {
        let device = registry.get(address).await.ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let channel = match resolve_characteristic(&device, None, &action.characteristic) {
            Ok(channel) if channel.notifiable => channel.clone(),
            Ok(_) => {
                log::warn!("gatt allow_notifications: {} on {address} does not support notify, skipping", action.characteristic);
                continue;
            }
            Err(_) => {
                log::warn!("gatt allow_notifications: characteristic {} not found on {address}, skipping", action.characteristic);
                continue;
            }
        };
        let enable_result = sessions
            .with_peripheral(address, {
                let channel = channel.clone();
                move |peripheral| Box::pin(async move { GattOps::allow_notifications(peripheral, &channel).await })
            })
            .await;
        if let Err(err) = enable_result {
            apply_keep(sessions, address, keep_to_policy(keep, Some(Duration::from_secs(DEFAULT_NOTIFY_KEEP_SECS as u64)))).await;
            return Err(err);
        }
        subscribed_any = true;
        // Persist the declared type against the handle: the notification
        // listener only ever sees raw bytes off the wire, so this is the
        // only place that ever learns how a given handle should be decoded.
        let declared_type = super::ValueType::from_code(action.value_type.unwrap_or(0))?;
        registry.with_mut(address, |d| if let Some(ch) = d.channel_by_handle_mut(channel.handle) { ch.value_type = declared_type }).await;
        if let Some(value) = &action.value {
            let mut write_channel = channel.clone();
            write_channel.value_type = super::ValueType::from_code(action.value_type.unwrap_or(0))?;
            let value = value.clone();
            sessions
                .with_peripheral(address, move |peripheral| Box::pin(async move { GattOps::write(peripheral, &write_channel, &value).await }))
                .await?;
        }
    }

    if subscribed_any {
        sessions.start_notification_listener(address, move |n: RawNotification| on_notification(address, n));
    }

    apply_keep(sessions, address, keep_to_policy(keep, Some(Duration::from_secs(DEFAULT_NOTIFY_KEEP_SECS as u64)))).await;
    Ok(())
}

/// Enumerates services and characteristics as a JSON description:
/// `{services: [{uuid, characteristics: [uuid | {uuid, properties}]}]}`.
pub async fn discover<A: HciAdapter + 'static>(
    sessions: &Arc<SessionManager<A>>, registry: &DeviceRegistry, address: Address, address_type: AddressType, keep: Option<i64>, service: Option<&str>, include_properties: bool,
) -> Result<serde_json::Value> {
    let _txn = sessions.begin_transaction(address).await;
    ensure_connected(sessions, registry, address, address_type).await?;
    ensure_discovered(sessions, registry, address).await?;

    let device = registry.get(address).await.ok_or_else(|| Error::new(ErrorKind::NotFound))?;
    let wanted = service.map(parse_service_ref).transpose()?;

    let services: Vec<serde_json::Value> = device
        .services
        .iter()
        .filter(|s| wanted.map_or(true, |want| want == s.uuid))
        .map(|s| {
            let characteristics: Vec<serde_json::Value> = s
                .channels
                .iter()
                .map(|c| {
                    if include_properties {
                        serde_json::json!({
                            "uuid": format_characteristic(c),
                            "properties": {"read": c.readable, "write": c.writable, "notify": c.notifiable},
                        })
                    } else {
                        serde_json::Value::String(format_characteristic(c))
                    }
                })
                .collect();
            serde_json::json!({"uuid": s.uuid.to_string(), "characteristics": characteristics})
        })
        .collect();

    apply_keep(sessions, address, keep_to_policy(keep, None)).await;
    Ok(serde_json::json!({ "services": services }))
}

fn parse_service_ref(s: &str) -> Result<uuid::Uuid> {
    if let Ok(short) = u16::from_str_radix(s, 16) {
        if s.len() <= 4 {
            return Ok(uuid::Uuid::from_u16(short));
        }
    }
    uuid::Uuid::parse_str(s).map_err(|_| Error::with_message(ErrorKind::InvalidAddress(s.to_string()), "not a valid service UUID"))
}

/// Renders a characteristic UUID as the short lowercase hex form when it
/// falls within the Bluetooth base UUID range, else the full UUID string.
fn format_characteristic(channel: &Channel) -> String {
    match channel.uuid.as_u16() {
        Some(short) => format!("{short:04x}"),
        None => channel.uuid.to_string(),
    }
}

fn is_connection_lost(err: &Error) -> bool {
    matches!(err.kind, ErrorKind::Transport(_) | ErrorKind::WrongState)
}

/// Maps a [`crate::ErrorKind`] produced by one of this module's operations
/// to the numeric code published on `gatt_result`.
/// `command` disambiguates read/write/notify failures that could otherwise
/// share an `ErrorKind`.
pub fn error_code_for(command_is_write: bool, command_is_notify: bool, err: &Error) -> i32 {
    match &err.kind {
        ErrorKind::ConnectFailed => error_code::CONNECT_FAILED,
        ErrorKind::DecodeError | ErrorKind::NotFound | ErrorKind::BadCommand(_) | ErrorKind::InvalidAddress(_) => {
            if command_is_notify {
                error_code::NOTIFY_FAILED
            } else if command_is_write {
                error_code::WRITE_FAILED
            } else {
                error_code::READ_FAILED
            }
        }
        ErrorKind::Transport(_) | ErrorKind::Timeout | ErrorKind::Internal(_) => error_code::TRANSPORT_EXCEPTION,
        _ if command_is_notify => error_code::NOTIFY_FAILED,
        _ if command_is_write => error_code::WRITE_FAILED,
        _ => error_code::READ_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_zero_means_disconnect_immediately() {
        assert_eq!(keep_to_policy(Some(0), None), None);
        assert_eq!(keep_to_policy(None, None), None);
    }

    #[test]
    fn keep_positive_arms_a_timer() {
        assert_eq!(keep_to_policy(Some(5), None), Some(Duration::from_secs(5)));
    }

    #[test]
    fn notify_defaults_to_ten_seconds_when_non_positive() {
        let default = Some(Duration::from_secs(DEFAULT_NOTIFY_KEEP_SECS as u64));
        assert_eq!(keep_to_policy(None, default), default);
        assert_eq!(keep_to_policy(Some(-1), default), default);
        assert_eq!(keep_to_policy(Some(7), default), Some(Duration::from_secs(7)));
    }
}
