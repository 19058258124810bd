//! # BLE Gateway Core
//!
//! This crate implements the concurrent engine at the heart of a Bluetooth
//! Low Energy gateway: it multiplexes a single scanning activity and many
//! simultaneous GATT transactions over one host controller interface.
//!
//! The engine is generic over the radio transport: it consumes an
//! [`HciAdapter`](adapter_trait::HciAdapter) implementation and never talks
//! to BlueZ (or any other stack) directly. When the `bluez` feature is
//! enabled, a concrete adapter backed by `org.bluez` over D-Bus is provided
//! in [`bluez`].
//!
//! ## Modules
//!
//! * [`ad`] — advertisement TLV parsing and payload decoding (Eddystone,
//!   iBeacon, GATT assigned-number service data).
//! * [`filter`] — ordered advertisement predicates.
//! * [`device`] — the device registry and per-device state.
//! * [`session`] — per-device transaction locking, auto-disconnect timers,
//!   and notification listener lifecycle.
//! * [`gatt`] — read/write/notify primitives with type coercion.
//! * [`scanner`] — scan-loop driving in sync/async/indefinite/periodic modes.
//! * [`orchestrator`] — scan/connect mutual exclusion and command routing.
//! * [`dispatch`] — throttled, panic-isolated callback invocation.
//! * [`bluez`] — concrete BlueZ/D-Bus adapter (feature `bluez`).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("the bluez adapter backend only supports the Linux operating system");

use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::{Display, EnumString};

mod sys;
mod uuid_ext;
pub use uuid_ext::UuidExt;
#[doc(no_inline)]
pub use uuid::Uuid;

pub mod ad;
pub mod device;
pub mod dispatch;
pub mod filter;
pub mod gatt;
pub mod message;
pub mod orchestrator;
pub mod scanner;
pub mod session;

pub mod adapter_trait;
pub use adapter_trait::{HciAdapter, Peripheral};

#[cfg(feature = "bluez")]
#[cfg_attr(docsrs, doc(cfg(feature = "bluez")))]
pub mod bluez;

pub use device::{ConnState, Device, DeviceRegistry};
pub use dispatch::{CallbackDispatcher, ScanDelegate};
pub use filter::{Filter, FilterChain};
pub use gatt::{GattOps, ValueType};
pub use orchestrator::{ExclusionGate, Orchestrator};
pub use scanner::Scanner;
pub use session::SessionManager;

/// Gateway error.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed message, when the underlying transport or decoder supplied one.
    pub message: String,
}

/// Gateway error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth device not found or connect attempt failed
    ConnectFailed,
    /// Bluetooth device already connected
    AlreadyConnected,
    /// Bluetooth operation attempted in the wrong device state
    WrongState,
    /// GATT services have not been resolved for this device
    ServicesUnresolved,
    /// the requested GATT characteristic or descriptor was not found
    #[strum(disabled)]
    NotFound,
    /// malformed advertisement data
    #[strum(disabled)]
    BadAdvertisement,
    /// malformed command payload: {0}
    #[strum(disabled)]
    BadCommand(String),
    /// failed to decode value for declared type
    #[strum(disabled)]
    DecodeError,
    /// Bluetooth operation timed out
    Timeout,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// transport error: {0}
    #[strum(disabled)]
    Transport(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind.
///
/// Covers faults that indicate a bug in the gateway or an incompatibility
/// with the underlying adapter implementation, rather than an expected
/// radio-level failure.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid value
    InvalidValue,
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    #[cfg(feature = "bluez")]
    /// D-Bus error {0}
    DBus(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

/// Gateway result.
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric GATT result codes published on `gatt_result/{gw_id}/{mac}`.
///
/// Stable across releases; callers on the message bus match on these values.
pub mod error_code {
    /// Operation completed without error.
    pub const SUCCESS: i32 = 0;
    /// Device not found, or the connect attempt failed.
    pub const CONNECT_FAILED: i32 = 3;
    /// Underlying transport raised an exception.
    pub const TRANSPORT_EXCEPTION: i32 = 4;
    /// A characteristic or descriptor read failed.
    pub const READ_FAILED: i32 = 6;
    /// A characteristic or descriptor write failed.
    pub const WRITE_FAILED: i32 = 9;
    /// Enabling notifications on a characteristic failed.
    pub const NOTIFY_FAILED: i32 = 11;

    /// Maps a connection-establishment failure to its numeric code.
    ///
    /// Read/write/notify failures are mapped at the call site in
    /// [`crate::gatt`] since the same [`crate::ErrorKind`] can occur during
    /// any of those three operations and the code depends on which one was
    /// in flight, not on the error kind alone.
    pub fn from_connect_error(_err: &crate::Error) -> i32 {
        CONNECT_FAILED
    }
}

/// Bluetooth device address, stored most-significant-byte first (as printed).
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new address from its byte representation.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// The all-zero address, used as a sentinel.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

/// Bluetooth device address type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive)]
#[repr(u8)]
pub enum AddressType {
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = sys::BDADDR_LE_PUBLIC,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = sys::BDADDR_LE_RANDOM,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display_and_parse() {
        let addr = Address::new([0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33]);
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("not-a-mac".parse::<Address>().is_err());
    }
}
