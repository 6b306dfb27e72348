//! Configuration loading from TOML files
//!
//! The binaries choose the path (clap flag or `CONFIG_FILE`); this module
//! parses and validates it.

use crate::domain::types::{Category, ClassId};
use crate::services::counter::DEFAULT_RETENTION_WINDOWS;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Source of window boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Fixed wall-clock interval
    Wall,
    /// Frame timestamps carried in tracker messages
    Stream,
}

impl ClockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockMode::Wall => "wall",
            ClockMode::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic the tracker publishes frames to
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_mqtt_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "tracker/objects".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterConfig {
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Number of past windows retained for deduplication
    #[serde(default = "default_retention_windows")]
    pub retention_windows: usize,
    /// Category labels to count, in processing order
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_clock")]
    pub clock: ClockMode,
    /// Ingest channel capacity (batches)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Raw class code (as string key) to category label; empty = COCO defaults
    #[serde(default)]
    pub class_map: HashMap<String, String>,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            retention_windows: default_retention_windows(),
            categories: default_categories(),
            clock: default_clock(),
            channel_capacity: default_channel_capacity(),
            class_map: HashMap::new(),
        }
    }
}

fn default_window_ms() -> u64 {
    1000
}

fn default_retention_windows() -> usize {
    DEFAULT_RETENTION_WINDOWS
}

fn default_categories() -> Vec<String> {
    Category::ALL.iter().map(|c| c.as_str().to_string()).collect()
}

fn default_clock() -> ClockMode {
    ClockMode::Wall
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for snapshot egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "counts.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Topic for count snapshots (QoS 1)
    #[serde(default = "default_counts_topic")]
    pub counts_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Interval for publishing metrics (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_egress_enabled(),
            counts_topic: default_counts_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_counts_topic() -> String {
    "traffic/counts".to_string()
}

fn default_metrics_topic() -> String {
    "traffic/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "junction-4")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "traffic".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub counter: CounterConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Raw detector class code to category mapping
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMap {
    classes: HashMap<ClassId, Category>,
}

impl CategoryMap {
    /// COCO codes used by the stock detector: 1 bicycle, 2 car, 3 motorcycle, 5 bus, 7 truck
    pub fn coco() -> Self {
        let classes = [1, 2, 3, 5, 7]
            .into_iter()
            .filter_map(|code| Category::from_coco_class(ClassId(code)).map(|c| (ClassId(code), c)))
            .collect();
        Self { classes }
    }

    /// Build from config entries; string keys must parse as integers and
    /// values must name known categories
    pub fn from_entries(entries: &HashMap<String, String>) -> anyhow::Result<Self> {
        if entries.is_empty() {
            return Ok(Self::coco());
        }

        let mut classes = HashMap::with_capacity(entries.len());
        for (key, label) in entries {
            let code: i32 = key
                .trim()
                .parse()
                .with_context(|| format!("class_map key '{}' is not an integer", key))?;
            let category: Category = label.parse().map_err(anyhow::Error::msg)?;
            classes.insert(ClassId(code), category);
        }
        Ok(Self { classes })
    }

    #[inline]
    pub fn lookup(&self, class_id: ClassId) -> Option<Category> {
        self.classes.get(&class_id).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for CategoryMap {
    fn default() -> Self {
        Self::coco()
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    window_ms: u64,
    retention_windows: usize,
    categories: Vec<Category>,
    clock_mode: ClockMode,
    channel_capacity: usize,
    category_map: CategoryMap,
    egress_file: String,
    mqtt_egress_enabled: bool,
    mqtt_egress_counts_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_metrics_interval_secs: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_topic: default_mqtt_topic(),
            mqtt_username: None,
            mqtt_password: None,
            window_ms: default_window_ms(),
            retention_windows: default_retention_windows(),
            categories: Category::ALL.to_vec(),
            clock_mode: default_clock(),
            channel_capacity: default_channel_capacity(),
            category_map: CategoryMap::coco(),
            egress_file: default_egress_file(),
            mqtt_egress_enabled: default_mqtt_egress_enabled(),
            mqtt_egress_counts_topic: default_counts_topic(),
            mqtt_egress_metrics_topic: default_metrics_topic(),
            mqtt_egress_metrics_interval_secs: default_metrics_publish_interval(),
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Build and validate from parsed TOML sections
    pub fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let counter = toml_config.counter;

        if counter.window_ms == 0 {
            bail!("counter.window_ms must be at least 1");
        }
        if counter.retention_windows == 0 {
            bail!("counter.retention_windows must be at least 1");
        }
        if counter.categories.is_empty() {
            bail!("counter.categories must not be empty");
        }
        if counter.channel_capacity == 0 {
            bail!("counter.channel_capacity must be at least 1");
        }

        let categories = counter
            .categories
            .iter()
            .map(|label| label.parse::<Category>().map_err(anyhow::Error::msg))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("counter.categories")?;

        let category_map =
            CategoryMap::from_entries(&counter.class_map).context("counter.class_map")?;

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic: toml_config.mqtt.topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            window_ms: counter.window_ms,
            retention_windows: counter.retention_windows,
            categories,
            clock_mode: counter.clock,
            channel_capacity: counter.channel_capacity,
            category_map,
            egress_file: toml_config.egress.file,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_counts_topic: toml_config.mqtt_egress.counts_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_metrics_interval_secs: toml_config
                .mqtt_egress
                .metrics_publish_interval_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        })
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn retention_windows(&self) -> usize {
        self.retention_windows
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn clock_mode(&self) -> ClockMode {
        self.clock_mode
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn category_map(&self) -> &CategoryMap {
        &self.category_map
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_counts_topic(&self) -> &str {
        &self.mqtt_egress_counts_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to override the clock mode
    pub fn with_clock_mode(mut self, mode: ClockMode) -> Self {
        self.clock_mode = mode;
        self
    }

    /// Builder method to override the egress file
    pub fn with_egress_file(mut self, file: &str) -> Self {
        self.egress_file = file.to_string();
        self
    }

    /// Builder method to override window length and retention
    ///
    /// Values are not validated; callers must pass non-zero lengths.
    pub fn with_window(mut self, window_ms: u64, retention_windows: usize) -> Self {
        self.window_ms = window_ms;
        self.retention_windows = retention_windows;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_topic(), "tracker/objects");
        assert_eq!(config.window_ms(), 1000);
        assert_eq!(config.retention_windows(), 60);
        assert_eq!(config.categories(), &Category::ALL);
        assert_eq!(config.clock_mode(), ClockMode::Wall);
        assert_eq!(config.egress_file(), "counts.jsonl");
    }

    #[test]
    fn test_default_category_map_is_coco() {
        let map = CategoryMap::default();
        assert_eq!(map.len(), 5);
        assert_eq!(map.lookup(ClassId(2)), Some(Category::Car));
        assert_eq!(map.lookup(ClassId(7)), Some(Category::Truck));
        assert_eq!(map.lookup(ClassId(0)), None);
    }

    #[test]
    fn test_category_map_override() {
        let entries = HashMap::from([
            ("10".to_string(), "car".to_string()),
            ("11".to_string(), "Truck".to_string()),
        ]);
        let map = CategoryMap::from_entries(&entries).unwrap();
        assert_eq!(map.lookup(ClassId(10)), Some(Category::Car));
        assert_eq!(map.lookup(ClassId(11)), Some(Category::Truck));
        // Overrides replace the defaults entirely
        assert_eq!(map.lookup(ClassId(2)), None);
    }

    #[test]
    fn test_category_map_rejects_bad_entries() {
        let bad_key = HashMap::from([("car".to_string(), "car".to_string())]);
        assert!(CategoryMap::from_entries(&bad_key).is_err());

        let bad_label = HashMap::from([("0".to_string(), "person".to_string())]);
        assert!(CategoryMap::from_entries(&bad_label).is_err());
    }

    #[test]
    fn test_from_toml_validation() {
        let mut toml_config = TomlConfig::default();
        toml_config.counter.retention_windows = 0;
        assert!(Config::from_toml(toml_config, "t".to_string()).is_err());

        let mut toml_config = TomlConfig::default();
        toml_config.counter.window_ms = 0;
        assert!(Config::from_toml(toml_config, "t".to_string()).is_err());

        let mut toml_config = TomlConfig::default();
        toml_config.counter.categories.clear();
        assert!(Config::from_toml(toml_config, "t".to_string()).is_err());

        let mut toml_config = TomlConfig::default();
        toml_config.counter.categories = vec!["car".to_string(), "tram".to_string()];
        assert!(Config::from_toml(toml_config, "t".to_string()).is_err());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let toml_config: TomlConfig = toml::from_str("").unwrap();
        let config = Config::from_toml(toml_config, "empty".to_string()).unwrap();
        assert_eq!(config.site_id(), "traffic");
        assert_eq!(config.retention_windows(), 60);
        assert_eq!(config.prometheus_port(), 9090);
        assert!(config.mqtt_egress_enabled());
    }
}
