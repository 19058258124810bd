//! [`MessageBus`] implementation over MQTT, using `rumqttc`.
//!
//! Grounded on the `HciAdapter`/`Peripheral` split in `ble-gateway-core`: the
//! core never talks MQTT directly, this module is the concrete sink wired up
//! by the binary, the same way `bluer`'s own `Session`/`Adapter` never know
//! about D-Bus transport details beyond what `dbus_tokio` hands them.

use ble_gateway_core::message::{Inbound, MessageBus, Topics};
use ble_gateway_core::{Error, ErrorKind, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// An MQTT v3.1.1 client bridging the gateway's three inbound/outbound topic
/// families onto a broker.
pub struct MqttBus {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
}

impl MqttBus {
    /// Connects to `host:port` under the given MQTT client id.
    ///
    /// The connection itself is established lazily by the first
    /// `eventloop.poll()` call, matching `rumqttc`'s own design; this
    /// constructor only builds the client and its channel.
    pub fn new(client_id: &str, host: &str, port: u16) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        Self { client, eventloop: Mutex::new(Some(eventloop)) }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        log::trace!("publishing {} bytes to {topic}", payload.len());
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| Error::with_message(ErrorKind::Transport(err.to_string()), "mqtt publish failed"))
    }

    async fn subscribe(&self, gw_id: &str) -> Result<BoxStream<'static, Inbound>> {
        let topics = Topics::new(gw_id);
        for topic in [topics.scan(), topics.filter(), topics.gatt_wildcard()] {
            log::debug!("subscribing to {topic}");
            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|err| Error::with_message(ErrorKind::Transport(err.to_string()), "mqtt subscribe failed"))?;
        }

        let mut eventloop = self
            .eventloop
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::with_message(ErrorKind::Transport("subscribe called more than once".to_string()), "mqtt"))?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let inbound = Inbound { topic: publish.topic, payload: publish.payload.to_vec() };
                        if tx.send(inbound).is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        log::warn!("mqtt connection error: {err}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
