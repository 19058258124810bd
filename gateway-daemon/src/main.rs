//! `ble-gateway-daemon` — bridges a BlueZ adapter to an MQTT control plane.
//!
//! Wires together [`ble_gateway_core::bluez::BluezAdapter`], an
//! [`mqtt::MqttBus`] and [`ble_gateway_core::orchestrator::Orchestrator`],
//! in the spirit of `bluer-tools`' own small `clap`-driven binaries.

mod config;
mod mqtt;

use crate::config::{default_config_path, GatewayConfig};
use crate::mqtt::MqttBus;
use ble_gateway_core::bluez::BluezAdapter;
use ble_gateway_core::orchestrator::Orchestrator;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

type AnyResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[clap(name = "ble-gateway-daemon", about = "Bridges a BlueZ adapter to an MQTT-based BLE gateway protocol")]
struct Opt {
    /// Path to the JSON configuration file.
    #[clap(long)]
    config: Option<PathBuf>,

    /// HCI interface to use, overriding the configured value.
    #[clap(long)]
    interface: Option<String>,

    /// Gateway id used in every message-bus topic, overriding the configured value.
    #[clap(long)]
    gateway_id: Option<String>,

    /// MQTT broker host.
    #[clap(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port.
    #[clap(long, default_value_t = 1883)]
    mqtt_port: u16,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    let opt = Opt::parse();

    let config_path = opt.config.clone().unwrap_or_else(default_config_path);
    let mut config = GatewayConfig::load_or_init(&config_path).await?;
    if let Some(interface) = opt.interface {
        config.interface = interface;
    }
    if let Some(gateway_id) = opt.gateway_id {
        config.gateway_id = gateway_id;
    }

    env_logger::Builder::new().parse_filters(config.trace.as_filter()).init();
    log::info!("starting gateway {} on {} (bluez debug: {})", config.gateway_id, config.interface, config.debug_bluez);

    let adapter = Arc::new(BluezAdapter::new(config.interface.clone()).await?);
    let bus = Arc::new(MqttBus::new(&config.gateway_id, &opt.mqtt_host, opt.mqtt_port));
    let orchestrator = Orchestrator::new(config.gateway_id.clone(), adapter, bus);

    let run = tokio::spawn(async move { orchestrator.run().await });

    tokio::select! {
        result = run => {
            match result {
                Ok(Ok(())) => log::info!("command stream ended"),
                Ok(Err(err)) => log::error!("orchestrator failed: {err}"),
                Err(err) => log::error!("orchestrator task panicked: {err}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
    }

    Ok(())
}
