//! Valves switched over MQTT: each actuator ref is a device under
//! `<prefix>/<ref>/set`.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::SharedState;
use crate::valve::{on_off, ValveActuator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadStyle {
    /// Bare `ON` / `OFF`.
    #[default]
    Plain,
    /// `{"state":"ON"}`, as zigbee2mqtt switches expect.
    Json,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "<prefix>/<actuator>/set", tolerating a trailing slash on the prefix.
pub(crate) fn valve_topic(prefix: &str, actuator: &str) -> String {
    format!("{}/{actuator}/set", prefix.trim_end_matches('/'))
}

pub(crate) fn valve_payload(style: PayloadStyle, on: bool) -> Vec<u8> {
    match style {
        PayloadStyle::Plain => on_off(on).as_bytes().to_vec(),
        PayloadStyle::Json => serde_json::json!({ "state": on_off(on) })
            .to_string()
            .into_bytes(),
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

/// Requests buffered between the client and the event loop.
const REQUEST_CAPACITY: usize = 20;

/// How long a publish may wait for room in the client's request queue.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MqttValves {
    client: AsyncClient,
    prefix: String,
    style: PayloadStyle,
    publish_timeout: Duration,
}

impl MqttValves {
    pub fn new(client: AsyncClient, prefix: impl Into<String>, style: PayloadStyle) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            style,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Client plus the event loop that must be polled for publishes to leave.
    pub fn connect(host: &str, port: u16, client_id: &str) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        AsyncClient::new(options, REQUEST_CAPACITY)
    }
}

#[async_trait]
impl ValveActuator for MqttValves {
    async fn set(&self, actuator: &str, on: bool) -> bool {
        let topic = valve_topic(&self.prefix, actuator);
        let publish = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, valve_payload(self.style, on));
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                info!(%topic, state = on_off(on), "valve command published");
                true
            }
            Ok(Err(e)) => {
                warn!(%topic, error = %e, "valve publish failed");
                false
            }
            Err(_) => {
                warn!(
                    %topic,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "valve publish timed out, request queue full"
                );
                false
            }
        }
    }
}

/// Drive the MQTT event loop in the background, recording connection state.
pub fn spawn_event_loop(mut eventloop: EventLoop, shared: SharedState) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt connection error, reconnecting");
                    {
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
