//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving tracker output
//! - `mqtt_egress` - MQTT publisher for snapshots and metrics
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `egress` - Snapshot output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use egress::Egress;
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender, MetricsPayload};
pub use mqtt::{parse_tracker_message, ParsedMessage};
pub use mqtt_egress::MqttPublisher;
