//! Count snapshot - the per-window output of the counter

use crate::domain::types::Category;
use chrono::{Local, TimeZone};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Render epoch ms as local wall-clock HH:MM:SS
pub fn local_hms(ts: u64) -> String {
    let Ok(ms) = i64::try_from(ts) else {
        return "00:00:00".to_string();
    };
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%H:%M:%S").to_string(),
        None => "00:00:00".to_string(),
    }
}

/// Deduplicated per-category counts for one window
#[derive(Debug, Clone, PartialEq)]
pub struct CountSnapshot {
    /// UUIDv7 snapshot ID
    pub id: String,
    /// Flush time (epoch ms) as supplied by the caller
    pub ts: u64,
    /// 1-based flush sequence number
    pub window: u64,
    /// Every tracked category, zero when nothing new was counted
    pub counts: BTreeMap<Category, u64>,
}

impl CountSnapshot {
    pub fn new(ts: u64, window: u64, counts: BTreeMap<Category, u64>) -> Self {
        Self { id: new_uuid_v7(), ts, window, counts }
    }

    /// Count for a category (0 if the category is not tracked)
    #[inline]
    pub fn count(&self, category: Category) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    /// Sum across all categories
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Build the flat document: one field per category label
    fn to_json_value(&self, site: Option<&str>) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        if let Some(site) = site {
            obj.insert("site".to_string(), serde_json::Value::String(site.to_string()));
        }
        obj.insert("ts".to_string(), serde_json::Value::Number(self.ts.into()));
        obj.insert("time".to_string(), serde_json::Value::String(local_hms(self.ts)));
        obj.insert("window".to_string(), serde_json::Value::Number(self.window.into()));
        for (category, count) in &self.counts {
            obj.insert(category.as_str().to_string(), serde_json::Value::Number((*count).into()));
        }
        serde_json::Value::Object(obj)
    }

    /// Serialize to the document shape consumed by persistence
    pub fn to_json(&self) -> String {
        self.to_json_value(None).to_string()
    }

    /// Serialize with a site identifier for multi-site consumers
    pub fn to_json_with_site(&self, site: &str) -> String {
        self.to_json_value(Some(site)).to_string()
    }
}
