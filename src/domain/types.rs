//! Shared types for the traffic counter

use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use std::time::Instant;

/// Newtype wrapper for tracker-assigned track IDs
///
/// Unique among live tracks only; the tracker recycles IDs over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub i64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for raw detector class codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClassId(pub i32);

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recognized vehicle categories
///
/// Declaration order is the output order of every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl Category {
    /// All categories in output order
    pub const ALL: [Category; 5] =
        [Category::Bicycle, Category::Car, Category::Motorcycle, Category::Bus, Category::Truck];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bicycle => "bicycle",
            Category::Car => "car",
            Category::Motorcycle => "motorcycle",
            Category::Bus => "bus",
            Category::Truck => "truck",
        }
    }

    /// Stable index into per-category arrays
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// COCO class code mapping used by the stock detector model
    pub fn from_coco_class(class_id: ClassId) -> Option<Category> {
        match class_id.0 {
            1 => Some(Category::Bicycle),
            2 => Some(Category::Car),
            3 => Some(Category::Motorcycle),
            5 => Some(Category::Bus),
            7 => Some(Category::Truck),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bicycle" => Ok(Category::Bicycle),
            "car" => Ok(Category::Car),
            "motorcycle" => Ok(Category::Motorcycle),
            "bus" => Ok(Category::Bus),
            "truck" => Ok(Category::Truck),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// Tracker message structure for parsing
#[derive(Debug, Deserialize)]
pub struct TrackerMessage {
    /// Camera or tracker instance name
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub frames: Vec<Frame>,
}

#[derive(Debug, Deserialize)]
pub struct Frame {
    /// Timestamp - can be ISO 8601 string or epoch milliseconds integer
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub time: TimestampValue,
    #[serde(default)]
    pub tracked_objects: Vec<TrackedObject>,
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Negative epochs are treated as missing
            match u64::try_from(value) {
                Ok(ms) => Ok(TimestampValue::EpochMs(ms)),
                Err(_) => Ok(TimestampValue::None),
            }
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// One tracked entity as reported by the external tracker
#[derive(Debug, Clone, Deserialize)]
pub struct TrackedObject {
    pub track_id: i64,
    pub class_id: i32,
    #[serde(default)]
    pub score: Option<f32>,
    /// [x, y, width, height] in frame pixels
    #[serde(default)]
    pub bbox: Vec<f32>,
}

/// A tracked entity that passed the category map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub track_id: TrackId,
    pub category: Category,
}

impl Observation {
    #[inline]
    pub fn new(track_id: TrackId, category: Category) -> Self {
        Self { track_id, category }
    }
}

/// All observations of one tracker frame
#[derive(Debug, Clone)]
pub struct ObservationBatch {
    /// Frame time (epoch ms) - stream time for window cadence
    pub frame_time_ms: u64,
    pub received_at: Instant,
    pub observations: SmallVec<[Observation; 16]>,
}

impl ObservationBatch {
    pub fn new(frame_time_ms: u64) -> Self {
        Self { frame_time_ms, received_at: Instant::now(), observations: SmallVec::new() }
    }

    pub fn with_observation(mut self, track_id: i64, category: Category) -> Self {
        self.observations.push(Observation::new(TrackId(track_id), category));
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_str() {
        assert_eq!("car".parse::<Category>().unwrap(), Category::Car);
        assert_eq!("TRUCK".parse::<Category>().unwrap(), Category::Truck);
        assert!("person".parse::<Category>().is_err());
    }

    #[test]
    fn test_coco_mapping() {
        assert_eq!(Category::from_coco_class(ClassId(1)), Some(Category::Bicycle));
        assert_eq!(Category::from_coco_class(ClassId(2)), Some(Category::Car));
        assert_eq!(Category::from_coco_class(ClassId(3)), Some(Category::Motorcycle));
        assert_eq!(Category::from_coco_class(ClassId(5)), Some(Category::Bus));
        assert_eq!(Category::from_coco_class(ClassId(7)), Some(Category::Truck));
        // person, airplane, train
        assert_eq!(Category::from_coco_class(ClassId(0)), None);
        assert_eq!(Category::from_coco_class(ClassId(4)), None);
        assert_eq!(Category::from_coco_class(ClassId(6)), None);
    }

    #[test]
    fn test_category_index_matches_all_order() {
        for (i, category) in Category::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn test_frame_time_variants() {
        let json = r#"{"frames": [
            {"time": 1767617600000, "tracked_objects": []},
            {"time": "2026-01-05T16:41:30.048+00:00"},
            {}
        ]}"#;
        let msg: TrackerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg.frames[0].time, TimestampValue::EpochMs(1767617600000)));
        assert!(matches!(msg.frames[1].time, TimestampValue::IsoString(_)));
        assert!(matches!(msg.frames[2].time, TimestampValue::None));
    }
}
