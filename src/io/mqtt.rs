//! MQTT client for receiving tracker output

use crate::domain::snapshot::epoch_ms;
use crate::domain::types::{
    ClassId, Frame, ObservationBatch, TimestampValue, TrackerMessage,
};
use crate::infra::config::{CategoryMap, Config};
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Observations extracted from one tracker message
#[derive(Debug, Default)]
pub struct ParsedMessage {
    /// One batch per frame, in message order
    pub batches: Vec<ObservationBatch>,
    /// Tracked objects whose class code has no category
    pub ignored: u64,
}

/// Start the MQTT client and send observation batches to the channel
///
/// Batches are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped batches are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    batch_tx: mpsc::Sender<ObservationBatch>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("traffic-counter-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtMostOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_ingest_subscribed");

    let category_map = config.category_map().clone();

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_ingest_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Instant::now();
                        let json_str = match std::str::from_utf8(&publish.payload) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "mqtt_ingest_invalid_utf8");
                                metrics.record_message_invalid();
                                continue;
                            }
                        };

                        let parsed = match parse_tracker_message(json_str, &category_map, received_at, epoch_ms()) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!(topic = %publish.topic, error = %e, "mqtt_ingest_parse_failed");
                                metrics.record_message_invalid();
                                continue;
                            }
                        };

                        metrics.record_observations_ignored(parsed.ignored);

                        for batch in parsed.batches {
                            if let Err(e) = batch_tx.try_send(batch) {
                                match e {
                                    TrySendError::Full(_) => {
                                        metrics.record_batch_dropped();
                                        if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                            warn!("mqtt_ingest_dropped: channel full");
                                            last_drop_warn = Instant::now();
                                        }
                                    }
                                    TrySendError::Closed(_) => {
                                        warn!("mqtt_ingest_channel_closed");
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_ingest_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_ingest_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Parse a tracker JSON message into one observation batch per frame
///
/// Frames without a usable timestamp take `received_ms`. Tracked objects
/// whose class code is not in `category_map` are dropped and counted in
/// `ignored`. Frames with no recognized objects still yield an empty batch
/// so stream-time window boundaries keep advancing.
pub fn parse_tracker_message(
    json_str: &str,
    category_map: &CategoryMap,
    received_at: Instant,
    received_ms: u64,
) -> Result<ParsedMessage, serde_json::Error> {
    let message: TrackerMessage = serde_json::from_str(json_str)?;

    let mut parsed = ParsedMessage { batches: Vec::with_capacity(message.frames.len()), ignored: 0 };

    for frame in &message.frames {
        let (batch, ignored) = parse_frame(frame, category_map, received_at, received_ms);
        parsed.ignored += ignored;
        parsed.batches.push(batch);
    }

    if let Some(source) = message.source.as_deref() {
        debug!(source = %source, frames = %parsed.batches.len(), ignored = %parsed.ignored, "tracker_message_parsed");
    }

    Ok(parsed)
}

/// Parse ISO 8601 timestamp to epoch milliseconds
fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

/// Extract epoch milliseconds from TimestampValue
fn timestamp_to_epoch_ms(ts: &TimestampValue) -> Option<u64> {
    match ts {
        TimestampValue::EpochMs(ms) => Some(*ms),
        TimestampValue::IsoString(s) => parse_iso_time(s),
        TimestampValue::None => None,
    }
}

fn parse_frame(
    frame: &Frame,
    category_map: &CategoryMap,
    received_at: Instant,
    received_ms: u64,
) -> (ObservationBatch, u64) {
    let frame_time_ms = timestamp_to_epoch_ms(&frame.time).unwrap_or(received_ms);

    let mut batch = ObservationBatch::new(frame_time_ms);
    batch.received_at = received_at;

    let mut ignored = 0u64;
    for obj in &frame.tracked_objects {
        match category_map.lookup(ClassId(obj.class_id)) {
            Some(category) => batch = batch.with_observation(obj.track_id, category),
            None => ignored += 1,
        }
    }

    (batch, ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Category, TrackId};

    fn parse(json: &str) -> ParsedMessage {
        parse_tracker_message(json, &CategoryMap::coco(), Instant::now(), 42).unwrap()
    }

    #[test]
    fn test_parse_frame_with_vehicles() {
        let json = r#"{
            "source": "cam-01",
            "frames": [{
                "time": "2026-01-05T16:41:30.048+00:00",
                "tracked_objects": [
                    {"track_id": 12, "class_id": 2, "score": 0.91, "bbox": [10.0, 20.0, 80.0, 40.0]},
                    {"track_id": 13, "class_id": 7}
                ]
            }]
        }"#;

        let parsed = parse(json);
        assert_eq!(parsed.batches.len(), 1);
        assert_eq!(parsed.ignored, 0);

        let batch = &parsed.batches[0];
        assert_eq!(batch.frame_time_ms, 1767631290048);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.observations[0].track_id, TrackId(12));
        assert_eq!(batch.observations[0].category, Category::Car);
        assert_eq!(batch.observations[1].category, Category::Truck);
    }

    #[test]
    fn test_unrecognized_classes_filtered() {
        let json = r#"{"frames": [{
            "time": 1767617600000,
            "tracked_objects": [
                {"track_id": 1, "class_id": 0},
                {"track_id": 2, "class_id": 6},
                {"track_id": 3, "class_id": 5}
            ]
        }]}"#;

        let parsed = parse(json);
        assert_eq!(parsed.ignored, 2);
        assert_eq!(parsed.batches[0].len(), 1);
        assert_eq!(parsed.batches[0].observations[0].category, Category::Bus);
        assert_eq!(parsed.batches[0].frame_time_ms, 1767617600000);
    }

    #[test]
    fn test_missing_time_uses_received_ms() {
        let json = r#"{"frames": [{"tracked_objects": [{"track_id": 1, "class_id": 2}]}]}"#;
        let parsed = parse(json);
        assert_eq!(parsed.batches[0].frame_time_ms, 42);
    }

    #[test]
    fn test_invalid_time_uses_received_ms() {
        let json = r#"{"frames": [{"time": "yesterday", "tracked_objects": []}]}"#;
        let parsed = parse(json);
        assert_eq!(parsed.batches[0].frame_time_ms, 42);
    }

    #[test]
    fn test_empty_frame_still_yields_batch() {
        let json = r#"{"frames": [{"time": 1000}, {"time": 2000}]}"#;
        let parsed = parse(json);
        assert_eq!(parsed.batches.len(), 2);
        assert!(parsed.batches[0].is_empty());
        assert_eq!(parsed.batches[1].frame_time_ms, 2000);
    }

    #[test]
    fn test_parse_invalid_json() {
        let result =
            parse_tracker_message("not json", &CategoryMap::coco(), Instant::now(), 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_iso_time() {
        let ms = parse_iso_time("2026-01-05T16:41:30.048+00:00").unwrap();
        assert_eq!(ms, 1767631290048);

        assert!(parse_iso_time("not a timestamp").is_none());
        assert!(parse_iso_time("").is_none());
    }
}
