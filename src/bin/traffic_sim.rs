//! Traffic Simulator - synthetic tracker output for local testing
//!
//! Publishes tracked-object frames over MQTT in the same format the tracker
//! produces. Vehicles enter, stay visible for a number of frames, and leave.
//! Track IDs wrap at `--max-track-id` so IDs are recycled the way a real
//! tracker recycles them. Pedestrians and other non-vehicle classes are mixed
//! in to exercise class filtering.
//!
//! Usage:
//!   cargo run --bin traffic-sim
//!   cargo run --bin traffic-sim -- --fps 15 --arrivals-per-min 120 --duration-secs 300

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// COCO class codes with relative arrival weights
const CLASS_WEIGHTS: &[(i32, u32)] = &[
    (2, 60), // car
    (7, 10), // truck
    (5, 4),  // bus
    (3, 6),  // motorcycle
    (1, 6),  // bicycle
    (0, 12), // person
    (6, 2),  // train
];

#[derive(Parser, Debug)]
#[command(name = "traffic-sim", version, about = "Synthetic tracker traffic publisher")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic to publish frames to
    #[arg(short, long, default_value = "tracker/objects")]
    topic: String,

    /// Frames per second
    #[arg(long, default_value = "10")]
    fps: u32,

    /// Mean arrivals per minute across all classes
    #[arg(long, default_value = "60")]
    arrivals_per_min: u32,

    /// Minimum frames an object stays visible
    #[arg(long, default_value = "20")]
    min_visible_frames: u32,

    /// Maximum frames an object stays visible
    #[arg(long, default_value = "80")]
    max_visible_frames: u32,

    /// Track IDs wrap back to 1 after this value
    #[arg(long, default_value = "500")]
    max_track_id: i64,

    /// Stop after this many seconds (0 runs until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration_secs: u64,

    /// Seed for the arrival generator
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Small xorshift generator for reproducible runs
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in [0, 1)
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in [lo, hi]
    fn range(&mut self, lo: u32, hi: u32) -> u32 {
        if hi <= lo {
            return lo;
        }
        lo + (self.next_u64() % u64::from(hi - lo + 1)) as u32
    }
}

#[derive(Debug, Clone)]
struct SimObject {
    track_id: i64,
    class_id: i32,
    frames_left: u32,
    x: f64,
    speed: f64,
}

struct Simulator {
    rng: XorShift,
    objects: Vec<SimObject>,
    next_track_id: i64,
    max_track_id: i64,
    arrival_prob: f64,
    min_frames: u32,
    max_frames: u32,
    spawned: u64,
}

impl Simulator {
    fn new(args: &Args) -> Self {
        let frames_per_min = f64::from(args.fps.max(1)) * 60.0;
        Self {
            rng: XorShift::new(args.seed),
            objects: Vec::new(),
            next_track_id: 1,
            max_track_id: args.max_track_id.max(1),
            arrival_prob: (f64::from(args.arrivals_per_min) / frames_per_min).min(1.0),
            min_frames: args.min_visible_frames,
            max_frames: args.max_visible_frames,
            spawned: 0,
        }
    }

    fn pick_class(&mut self) -> i32 {
        let total: u32 = CLASS_WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut roll = self.rng.range(0, total - 1);
        for (class_id, weight) in CLASS_WEIGHTS {
            if roll < *weight {
                return *class_id;
            }
            roll -= weight;
        }
        2
    }

    fn allocate_track_id(&mut self) -> i64 {
        let id = self.next_track_id;
        self.next_track_id = if id >= self.max_track_id { 1 } else { id + 1 };
        id
    }

    /// Advance one frame and return the visible objects
    fn step(&mut self) -> &[SimObject] {
        for obj in &mut self.objects {
            obj.frames_left = obj.frames_left.saturating_sub(1);
            obj.x += obj.speed;
        }
        self.objects.retain(|o| o.frames_left > 0);

        if self.rng.next_f64() < self.arrival_prob {
            let class_id = self.pick_class();
            let track_id = self.allocate_track_id();
            let frames_left = self.rng.range(self.min_frames.max(1), self.max_frames);
            let speed = 4.0 + self.rng.next_f64() * 12.0;
            debug!(track_id = %track_id, class_id = %class_id, frames = %frames_left, "sim_object_spawned");
            self.objects.push(SimObject { track_id, class_id, frames_left, x: 0.0, speed });
            self.spawned += 1;
        }

        &self.objects
    }
}

fn build_frame_message(objects: &[SimObject]) -> String {
    let tracked: Vec<serde_json::Value> = objects
        .iter()
        .map(|o| {
            json!({
                "track_id": o.track_id,
                "class_id": o.class_id,
                "score": 0.9,
                "bbox": [o.x, 200.0, 80.0, 40.0],
            })
        })
        .collect();

    json!({
        "source": "traffic-sim",
        "frames": [{
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "tracked_objects": tracked,
        }]
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let client_id = format!("traffic-sim-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_mqtt_connected"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        host = %args.mqtt_host,
        port = %args.mqtt_port,
        topic = %args.topic,
        fps = %args.fps,
        arrivals_per_min = %args.arrivals_per_min,
        max_track_id = %args.max_track_id,
        "traffic_sim_started"
    );

    let mut sim = Simulator::new(&args);
    let frame_period = Duration::from_millis(1000 / u64::from(args.fps.max(1)));
    let mut ticker = tokio::time::interval(frame_period);
    let deadline = (args.duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(args.duration_secs));
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    break;
                }
                let msg = build_frame_message(sim.step());
                if let Err(e) = client.publish(&args.topic, QoS::AtMostOnce, false, msg).await {
                    warn!(error = %e, "sim_publish_failed");
                }
                frames += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    info!(frames = %frames, spawned = %sim.spawned, "traffic_sim_stopped");
    Ok(())
}
