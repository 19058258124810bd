//! The message-bus wire format: topics and JSON payloads exchanged with the
//! remote controller.
//!
//! The core owns the shape of these messages (so replaying a recorded session
//! reproduces exact wire bytes), but not how they travel: [`MessageBus`] is the sink the
//! [`crate::orchestrator::Orchestrator`] publishes to and subscribes from,
//! and a concrete implementation (e.g. over MQTT) is wired up by the
//! surrounding binary.

use crate::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One message received off the bus: the topic it arrived on, and its raw
/// payload bytes.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// The topic the message was published on.
    pub topic: String,
    /// Raw payload bytes (JSON-encoded, per §6).
    pub payload: Vec<u8>,
}

/// The publish/subscribe sink the core requires.
///
/// Implementations are responsible for connection management, retry and
/// TLS; the core only ever calls `publish` and consumes the stream returned
/// by `subscribe`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> crate::Result<()>;

    /// Subscribes to the three inbound command topic families for gateway
    /// `gw_id` and returns a stream of messages matching any of them.
    async fn subscribe(&self, gw_id: &str) -> crate::Result<futures::stream::BoxStream<'static, Inbound>>;
}

/// Topic builder/matcher for one gateway instance.
///
/// Grounded on `ble_mqtt_service.py`'s topic string formatting: every topic
/// is `{family}/{gw_id}[/{mac}[/{sub_topic}]]`.
#[derive(Clone, Debug)]
pub struct Topics {
    gw_id: String,
}

impl Topics {
    /// Creates a topic builder for the given gateway id.
    pub fn new(gw_id: impl Into<String>) -> Self {
        Self { gw_id: gw_id.into() }
    }

    /// The gateway id this builder was constructed with.
    pub fn gw_id(&self) -> &str {
        &self.gw_id
    }

    /// `scan/{gw_id}`
    pub fn scan(&self) -> String {
        format!("scan/{}", self.gw_id)
    }

    /// `filter/{gw_id}`
    pub fn filter(&self) -> String {
        format!("filter/{}", self.gw_id)
    }

    /// `gatt/{gw_id}/+` — the subscription pattern for GATT commands
    /// addressed to any device.
    pub fn gatt_wildcard(&self) -> String {
        format!("gatt/{}/+", self.gw_id)
    }

    /// `gatt/{gw_id}/{mac}`
    pub fn gatt(&self, mac: Address) -> String {
        format!("gatt/{}/{}", self.gw_id, mac)
    }

    /// `advertisement/{gw_id}/{mac}`, optionally with a decoded sub-topic
    /// suffix (`eddystone`, `ibeacon`, or a decoded service-data name).
    pub fn advertisement(&self, mac: Address, sub_topic: Option<&str>) -> String {
        match sub_topic {
            Some(sub) => format!("advertisement/{}/{}/{}", self.gw_id, mac, sub),
            None => format!("advertisement/{}/{}", self.gw_id, mac),
        }
    }

    /// `scan_result/{gw_id}`
    pub fn scan_result(&self) -> String {
        format!("scan_result/{}", self.gw_id)
    }

    /// `gatt_result/{gw_id}/{mac}`
    pub fn gatt_result(&self, mac: Address) -> String {
        format!("gatt_result/{}/{}", self.gw_id, mac)
    }

    /// Extracts the MAC address from a `gatt/{gw_id}/{mac}` topic, if it
    /// matches this gateway's id.
    ///
    /// Per §6, the MAC must be exactly 17 characters (`xx:xx:xx:xx:xx:xx`)
    /// and is normalized to lowercase before parsing.
    pub fn parse_gatt_topic(&self, topic: &str) -> Option<Address> {
        let rest = topic.strip_prefix("gatt/")?.strip_prefix(&self.gw_id)?.strip_prefix('/')?;
        if rest.len() != 17 {
            return None;
        }
        rest.to_ascii_lowercase().parse().ok()
    }

    /// Whether `topic` is this gateway's scan-command topic.
    pub fn is_scan_topic(&self, topic: &str) -> bool {
        topic == self.scan()
    }

    /// Whether `topic` is this gateway's filter-reconfiguration topic.
    pub fn is_filter_topic(&self, topic: &str) -> bool {
        topic == self.filter()
    }
}

/// `scan/{gw_id}` command kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanCommandKind {
    /// Starts a scan (one-shot or indefinite, depending on `timeout`).
    Start,
    /// Stops the current scan, if any.
    Stop,
    /// Starts a periodic scan (`timeout` on, `period` cadence).
    TimeScan,
}

/// How much advertisement detail scan results should carry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// No per-device detail in the scan-end summary.
    #[default]
    None,
    /// Just counts.
    Summary,
    /// A full per-device listing.
    Devices,
}

/// Whether and how much advertisement traffic is published live during a scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertisementMode {
    /// Publish nothing per-advertisement.
    #[default]
    None,
    /// Publish a minimal per-advertisement payload (address, RSSI, name).
    Min,
    /// Publish the full decoded advertisement record.
    Full,
}

/// `scan/{gw_id}` command payload.
#[derive(Clone, Debug, Deserialize)]
pub struct ScanCommand {
    /// Which scan operation to perform.
    pub command: ScanCommandKind,
    /// Scan duration in seconds; `None`/`0` means run until `stop`.
    pub timeout: Option<u64>,
    /// Cadence for `time_scan`; the breath between cycles is
    /// `max(0, period - timeout)`.
    pub period: Option<u64>,
    /// How much detail to include in the `scan_result` summary.
    #[serde(default)]
    pub result: ResultMode,
    /// How much detail to publish per advertisement while scanning.
    #[serde(default)]
    pub advertisement: AdvertisementMode,
    /// Whether to publish advertisement events under a decoded sub-topic
    /// (`eddystone`/`ibeacon`/service-data name) in addition to the bare
    /// per-device topic.
    #[serde(default)]
    pub sub_topics: bool,
    /// Minimum seconds between advertisement callbacks for the same device;
    /// `0` (the default) delivers every advertisement.
    #[serde(default)]
    pub adv_interval: u64,
    /// Whether to disconnect any connected device before starting the scan,
    /// rather than waiting for it to disconnect on its own.
    #[serde(default)]
    pub force_disconnect: bool,
}

/// One filter specification within a `filter/{gw_id}` command array.
///
/// Grounded on the `BLE_Filter_*` classes in `BLE_Client.py`; `none` is kept
/// as an explicit no-op variant since the original allows a filter list
/// entry that matches everything (used to clear a slot without shifting
/// indices).
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Minimum RSSI, in dBm.
    Rssi { min_rssi: i16 },
    /// Address whitelist.
    WhiteList { addresses: Vec<Address> },
    /// Required connectable flag.
    Connectable { connectable_flag: bool },
    /// Required local-name prefix.
    StartsWith { match_string: String },
    /// Required manufacturer ID.
    MfgIdEq { mfg_id: u16 },
    /// No-op filter; always accepts.
    None,
}

impl FilterSpec {
    /// Converts to the runtime [`crate::filter::Filter`] representation,
    /// dropping `None` entries (they contribute nothing to the chain).
    pub fn into_filter(self) -> Option<crate::filter::Filter> {
        use crate::filter::Filter;
        match self {
            FilterSpec::Rssi { min_rssi } => Some(Filter::Rssi(min_rssi)),
            FilterSpec::WhiteList { addresses } => Some(Filter::Whitelist(addresses.into_iter().collect())),
            FilterSpec::Connectable { connectable_flag } => Some(Filter::Connectable(connectable_flag)),
            FilterSpec::StartsWith { match_string } => Some(Filter::NamePrefix(match_string)),
            FilterSpec::MfgIdEq { mfg_id } => Some(Filter::MfgIdEq(mfg_id)),
            FilterSpec::None => None,
        }
    }
}

/// `gatt/{gw_id}/{mac}` command kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GattCommandKind {
    /// Reads one or more characteristics.
    Read,
    /// Writes one or more characteristics.
    Write,
    /// Enumerates services/characteristics.
    Discover,
    /// Enables notifications on one or more characteristics.
    AllowNotifications,
}

/// One action within a GATT command's `action_set`, or the single implicit
/// action for a command given `characteristic`/`type`/`value` directly.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GattActionSpec {
    /// Target characteristic, as a 16-bit hex string or full UUID.
    pub characteristic: String,
    /// Declared value type (see [`crate::gatt::ValueType`]'s numeric mapping).
    #[serde(rename = "type")]
    pub value_type: Option<u8>,
    /// Value to write; ignored for `read`/`discover`/pure `allow_notifications`.
    pub value: Option<serde_json::Value>,
}

/// `gatt/{gw_id}/{mac}` command payload.
#[derive(Clone, Debug, Deserialize)]
pub struct GattCommand {
    /// Which GATT operation to perform.
    pub command: GattCommandKind,
    /// Caller-supplied correlation id, echoed back on the result.
    pub transac_id: Option<i64>,
    /// Seconds to keep the connection open afterwards (0 ⇒ disconnect
    /// immediately). Defaults per-operation when absent.
    pub keep: Option<i64>,
    /// Restricts `discover` to one service.
    pub service: Option<String>,
    /// Whether `discover` should include characteristic property bits.
    #[serde(default)]
    pub properties: bool,
    /// Single-action shorthand: target characteristic.
    pub characteristic: Option<String>,
    /// Single-action shorthand: declared value type.
    #[serde(rename = "type")]
    pub value_type: Option<u8>,
    /// Single-action shorthand: value to write.
    pub value: Option<serde_json::Value>,
    /// Batch form; when present, takes precedence over the single-action
    /// shorthand fields above.
    pub action_set: Option<Vec<GattActionSpec>>,
    /// Whether to wait for an in-progress scan to finish rather than being
    /// rejected outright. Defaults to `true`.
    #[serde(default = "default_true")]
    pub queue: bool,
}

fn default_true() -> bool {
    true
}

impl GattCommand {
    /// Normalizes the single-action shorthand and the `action_set` batch
    /// form into one list of actions.
    pub fn actions(&self) -> Vec<GattActionSpec> {
        if let Some(set) = &self.action_set {
            set.clone()
        } else if let Some(characteristic) = &self.characteristic {
            vec![GattActionSpec {
                characteristic: characteristic.clone(),
                value_type: self.value_type,
                value: self.value.clone(),
            }]
        } else {
            Vec::new()
        }
    }
}

/// Outbound `advertisement/{gw_id}/{mac}[/{sub_topic}]` payload.
#[derive(Clone, Debug, Serialize)]
pub struct AdvertisementEvent {
    /// Device address.
    pub address: Address,
    /// Local name, if advertised.
    pub name: Option<String>,
    /// Most recent RSSI, in dBm.
    pub rssi: Option<i16>,
    /// Running-max RSSI within the current scan cycle.
    pub max_rssi: Option<i16>,
    /// Whether the device is reported as connectable.
    pub connectable: bool,
    /// Flags byte, if present.
    pub flags: Option<u8>,
    /// Decoded service-data values, keyed by name (falls back to the
    /// lowercase hex UUID when no decoder matched).
    pub service_data: serde_json::Map<String, serde_json::Value>,
    /// Manufacturer ID, if present.
    pub manufacturer_id: Option<u16>,
    /// Manufacturer payload, hex-encoded.
    pub manufacturer_data: Option<String>,
    /// Name of the vendor decoder that matched `manufacturer_id`, if any
    /// (e.g. `"ruuvi"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_name: Option<&'static str>,
    /// Decoded manufacturer payload, when a vendor decoder matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_value: Option<serde_json::Value>,
    /// Recognized beacon kind, for informational purposes.
    pub kind: &'static str,
}

/// Outbound `scan_result/{gw_id}` payload.
#[derive(Clone, Debug, Serialize)]
pub struct ScanResultEvent {
    /// Unix timestamp (seconds) the scan ended.
    pub timestamp: i64,
    /// `0` on success; nonzero mirrors the adapter-level transport error.
    pub error: i32,
    /// Number of advertisements observed during the scan.
    pub dev_detected: usize,
    /// Number of devices admitted by the active [`crate::filter::FilterChain`].
    pub dev_selected: usize,
    /// Present when the originating command asked for `result: "devices"`.
    pub devices: Option<Vec<AdvertisementEvent>>,
}

/// One coerced value within a `gatt_result` response.
#[derive(Clone, Debug, Serialize)]
pub struct GattResultValue {
    /// Characteristic the value belongs to, lowercase hex or full UUID.
    pub characteristic: String,
    /// Declared value type, echoed back.
    #[serde(rename = "type")]
    pub value_type: u8,
    /// Coerced value.
    pub value: serde_json::Value,
}

/// Outbound `gatt_result/{gw_id}/{mac}` payload, for both command results
/// and notification deliveries.
#[derive(Clone, Debug, Serialize)]
pub struct GattResultEvent {
    /// Echoes the originating command (or `"notification"`).
    pub command: String,
    /// Numeric error code; see [`crate::error_code`].
    pub error: i32,
    /// Echoes the originating command's `transac_id`, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transac_id: Option<i64>,
    /// Per-action results, when the operation produced values
    /// (`read`/notification delivery).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<GattResultValue>>,
    /// The service/characteristic listing produced by a `discover` command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<serde_json::Value>,
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.topic, self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_the_gw_id_parameterized_shape() {
        let topics = Topics::new("gw-1");
        assert_eq!(topics.scan(), "scan/gw-1");
        assert_eq!(topics.filter(), "filter/gw-1");
        let mac = Address::new([0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33]);
        assert_eq!(topics.gatt(mac), "gatt/gw-1/aa:bb:cc:11:22:33");
        assert_eq!(topics.advertisement(mac, None), "advertisement/gw-1/aa:bb:cc:11:22:33");
        assert_eq!(
            topics.advertisement(mac, Some("eddystone")),
            "advertisement/gw-1/aa:bb:cc:11:22:33/eddystone"
        );
        assert_eq!(topics.scan_result(), "scan_result/gw-1");
        assert_eq!(topics.gatt_result(mac), "gatt_result/gw-1/aa:bb:cc:11:22:33");
    }

    #[test]
    fn parse_gatt_topic_extracts_and_normalizes_the_mac() {
        let topics = Topics::new("gw-1");
        let mac = topics.parse_gatt_topic("gatt/gw-1/AA:BB:CC:11:22:33").unwrap();
        assert_eq!(mac, Address::new([0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33]));
        assert!(topics.parse_gatt_topic("gatt/other-gw/aa:bb:cc:11:22:33").is_none());
        assert!(topics.parse_gatt_topic("gatt/gw-1/not-a-mac").is_none());
    }

    #[test]
    fn scan_command_deserializes_with_defaults() {
        let cmd: ScanCommand = serde_json::from_str(r#"{"command":"start","timeout":10}"#).unwrap();
        assert_eq!(cmd.command, ScanCommandKind::Start);
        assert_eq!(cmd.timeout, Some(10));
        assert_eq!(cmd.result, ResultMode::None);
        assert_eq!(cmd.adv_interval, 0);
    }

    #[test]
    fn gatt_command_actions_prefers_action_set_over_shorthand() {
        let cmd: GattCommand = serde_json::from_str(
            r#"{"command":"read","action_set":[{"characteristic":"2a19","type":1}]}"#,
        )
        .unwrap();
        assert_eq!(cmd.actions().len(), 1);
        assert_eq!(cmd.actions()[0].characteristic, "2a19");

        let cmd: GattCommand = serde_json::from_str(r#"{"command":"read","characteristic":"2a19","type":1}"#).unwrap();
        assert_eq!(cmd.actions().len(), 1);
        assert!(cmd.queue);
    }

    #[test]
    fn filter_spec_array_decodes_to_filters() {
        let specs: Vec<FilterSpec> = serde_json::from_str(
            r#"[{"type":"rssi","min_rssi":-70},{"type":"connectable","connectable_flag":true}]"#,
        )
        .unwrap();
        let filters: Vec<_> = specs.into_iter().filter_map(FilterSpec::into_filter).collect();
        assert_eq!(filters.len(), 2);
    }
}
