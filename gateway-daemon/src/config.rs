//! On-disk gateway configuration.
//!
//! Ported from the original's `BLE_init_parameters` behavior: a single JSON
//! document is read from a well-known data directory; if it is missing,
//! defaults are constructed and written back so the file exists for the next
//! run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging verbosity, mirroring the original's `trace` configuration key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl TraceLevel {
    /// The `log`/`env_logger` filter string for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            TraceLevel::Debug => "debug",
            TraceLevel::Info => "info",
            TraceLevel::Warning => "warn",
            TraceLevel::Error => "error",
            TraceLevel::Critical => "error",
        }
    }
}

/// Persisted gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HCI interface name (e.g. `hci0`).
    pub interface: String,
    /// Notification ATT MTU requested on connect.
    pub notif_mtu: u16,
    /// Maximum number of simultaneously connected devices.
    pub max_connect: u32,
    /// Logging verbosity.
    pub trace: TraceLevel,
    /// Whether to enable BlueZ's own verbose D-Bus call tracing.
    pub debug_bluez: bool,
    /// This gateway instance's id, used in every message-bus topic.
    pub gateway_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            interface: "hci0".to_string(),
            notif_mtu: 63,
            max_connect: 4,
            trace: TraceLevel::default(),
            debug_bluez: false,
            gateway_id: "ble-gateway".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from `path`, writing defaults back if the file
    /// does not exist.
    pub async fn load_or_init(path: &Path) -> std::io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .unwrap_or_else(|err| {
                    log::warn!("{}: malformed config, falling back to defaults: {err}", path.display());
                    Self::default()
                })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path).await?;
                Ok(config)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes this configuration back to `path` as pretty-printed JSON,
    /// creating parent directories as needed.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self).expect("GatewayConfig always serializes");
        tokio::fs::write(path, json).await
    }
}

/// The default configuration file path, mirroring the original's
/// `/data/.../ble_gateway` location by using the platform's standard
/// per-user data directory instead of a hardcoded absolute path.
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "ble-gateway")
        .map(|dirs| dirs.data_dir().join("config.json"))
        .unwrap_or_else(|| PathBuf::from("ble-gateway-config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_writes_back_defaults() {
        let dir = std::env::temp_dir().join(format!("ble-gateway-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let config = GatewayConfig::load_or_init(&path).await.unwrap();
        assert_eq!(config.interface, "hci0");
        assert!(tokio::fs::try_exists(&path).await.unwrap());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn existing_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("ble-gateway-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let mut config = GatewayConfig::default();
        config.interface = "hci1".to_string();
        config.save(&path).await.unwrap();

        let loaded = GatewayConfig::load_or_init(&path).await.unwrap();
        assert_eq!(loaded.interface, "hci1");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
