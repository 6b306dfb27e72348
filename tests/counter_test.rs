//! Integration tests for windowed counting from tracker messages to snapshots

use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tempfile::tempdir;
use traffic_counter::domain::types::{Category, TrackId};
use traffic_counter::infra::{CategoryMap, ClockMode, Config, Metrics};
use traffic_counter::io::parse_tracker_message;
use traffic_counter::services::{CountAggregator, WindowedCategoryCounter};

fn frame_message(time_ms: u64, objects: &[(i64, i32)]) -> String {
    let tracked: Vec<String> = objects
        .iter()
        .map(|(id, class)| format!(r#"{{"track_id": {}, "class_id": {}}}"#, id, class))
        .collect();
    format!(r#"{{"frames": [{{"time": {}, "tracked_objects": [{}]}}]}}"#, time_ms, tracked.join(","))
}

#[test]
fn test_recycled_id_counted_again_after_retention() {
    let mut counter = WindowedCategoryCounter::new(&Category::ALL, 3);

    // Window 1: ids 10, 11 are cars; id 12 is a bus
    counter.observe(TrackId(10), Category::Car);
    counter.observe(TrackId(11), Category::Car);
    counter.observe(TrackId(12), Category::Bus);
    let w1 = counter.flush(1000);
    assert_eq!(w1.count(Category::Car), 2);
    assert_eq!(w1.count(Category::Bus), 1);

    // Window 2: id 10 still visible, id 12 reappears classified as a truck
    counter.observe(TrackId(10), Category::Car);
    counter.observe(TrackId(12), Category::Truck);
    let w2 = counter.flush(2000);
    assert_eq!(w2.total(), 0);

    // Windows 3-5: nothing visible
    for ts in [3000, 4000, 5000] {
        assert_eq!(counter.flush(ts).total(), 0);
    }

    // Window 6: the tracker reused id 11 for a new motorcycle
    counter.observe(TrackId(11), Category::Motorcycle);
    let w6 = counter.flush(6000);
    assert_eq!(w6.count(Category::Motorcycle), 1);
    assert_eq!(counter.history_len(), 3);
}

#[test]
fn test_stream_replay_end_to_end() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("counts.jsonl");
    let config = Config::default()
        .with_clock_mode(ClockMode::Stream)
        .with_window(1000, 60)
        .with_egress_file(path.to_str().unwrap());
    let metrics = Arc::new(Metrics::new());
    let mut aggregator = CountAggregator::new(&config, metrics.clone(), None);
    let map = CategoryMap::coco();

    let messages = [
        // person (0) is ignored
        frame_message(0, &[(1, 2), (2, 0), (3, 7)]),
        frame_message(400, &[(1, 2), (3, 7)]),
        frame_message(1000, &[(1, 2), (4, 1)]),
        frame_message(2100, &[(5, 5)]),
    ];

    let mut snapshots = Vec::new();
    for msg in &messages {
        let parsed = parse_tracker_message(msg, &map, Instant::now(), 0).unwrap();
        metrics.record_observations_ignored(parsed.ignored);
        for batch in parsed.batches {
            snapshots.extend(aggregator.process_batch(batch));
        }
    }
    snapshots.extend(aggregator.finish());

    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[0].count(Category::Car), 1);
    assert_eq!(snapshots[0].count(Category::Truck), 1);
    assert_eq!(snapshots[1].count(Category::Car), 0);
    assert_eq!(snapshots[1].count(Category::Bicycle), 1);
    assert_eq!(snapshots[2].count(Category::Bus), 1);
    assert_eq!(snapshots[2].ts, 2100);

    let lines: Vec<serde_json::Value> = fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["window"], (i + 1) as u64);
        assert_eq!(line["site"], "traffic");
        assert!(line["time"].as_str().unwrap().len() == 8);
        for category in Category::ALL {
            assert!(line.get(category.as_str()).is_some());
        }
    }

    assert_eq!(metrics.observations_ignored(), 1);
    assert_eq!(metrics.windows_flushed(), 3);
}
