//! MQTT publisher for egress messages
//!
//! Publishes to MQTT topics for downstream consumers:
//! - traffic/counts - Count snapshots (QoS 1)
//! - traffic/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for queued publishes after disconnect is requested
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    eventloop_handle: JoinHandle<()>,
    rx: mpsc::Receiver<EgressMessage>,
    counts_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("traffic-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Requests are sent in order, so reaching the Disconnect packet means
        // every earlier publish has been written
        let eventloop_handle = tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("mqtt_egress_disconnected");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            eventloop_handle,
            rx,
            counts_topic: config.mqtt_egress_counts_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
        }
    }

    /// Run the publisher loop
    ///
    /// Publishes until every `EgressSender` is dropped, so snapshots produced
    /// during shutdown (the final partial window) still go out. Then
    /// disconnects and waits for the event loop to write queued publishes.
    pub async fn run(mut self) {
        info!(counts = %self.counts_topic, metrics = %self.metrics_topic, "mqtt_egress_started");

        while let Some(msg) = self.rx.recv().await {
            self.publish_message(msg).await;
        }
        info!("mqtt_egress_channel_closed");

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "mqtt_egress_disconnect_failed");
            self.eventloop_handle.abort();
            return;
        }

        match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.eventloop_handle).await {
            Ok(_) => info!("mqtt_egress_shutdown"),
            Err(_) => {
                warn!("mqtt_egress_disconnect_timeout");
                self.eventloop_handle.abort();
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Counts(payload) => {
                // At-least-once: each snapshot is a storage record
                if let Err(e) = self
                    .client
                    .publish(&self.counts_topic, QoS::AtLeastOnce, false, payload.json.as_bytes())
                    .await
                {
                    error!(error = %e, "mqtt_egress_counts_failed");
                }
            }
            EgressMessage::Metrics(payload) => {
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.metrics_topic, QoS::AtMostOnce, false, json.as_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_metrics_failed");
                    }
                }
            }
        }
    }
}
