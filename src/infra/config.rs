//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::geofence::{Geofence, GeofenceError};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

/// Configuration rejected by validation; the pipeline does not start
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("distance_filter must be a finite, non-negative number of meters (got {0})")]
    InvalidDistanceFilter(f64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("motion_threshold_m must be positive (got {0})")]
    InvalidMotionThreshold(f64),
    #[error("invalid geofence: {0}")]
    Geofence(#[from] GeofenceError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum displacement between emitted samples (meters)
    #[serde(default = "default_distance_filter")]
    pub distance_filter: f64,
    #[serde(default)]
    pub stop_on_terminate: bool,
    #[serde(default = "default_start_on_boot")]
    pub start_on_boot: bool,
    /// Periodic wake interval (seconds)
    #[serde(default = "default_minimum_fetch_interval")]
    pub minimum_fetch_interval_secs: u64,
    /// Emit a sample after this long even without displacement (seconds)
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            distance_filter: default_distance_filter(),
            stop_on_terminate: false,
            start_on_boot: default_start_on_boot(),
            minimum_fetch_interval_secs: default_minimum_fetch_interval(),
            max_interval_secs: default_max_interval(),
        }
    }
}

fn default_distance_filter() -> f64 {
    10.0
}

fn default_start_on_boot() -> bool {
    true
}

fn default_minimum_fetch_interval() -> u64 {
    900
}

fn default_max_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// No fix for this long marks the provider unavailable (seconds)
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { timeout_secs: default_provider_timeout() }
    }
}

fn default_provider_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Sliding window for accumulated displacement (seconds)
    #[serde(default = "default_motion_window")]
    pub window_secs: u64,
    /// Displacement within the window that means MOVING (meters)
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold_m: f64,
    /// No qualifying displacement for this long means STATIONARY (seconds)
    #[serde(default = "default_stationary_timeout")]
    pub stationary_timeout_secs: u64,
    /// How often the dwell timeout is checked without new samples (ms)
    #[serde(default = "default_motion_tick")]
    pub tick_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window_secs: default_motion_window(),
            motion_threshold_m: default_motion_threshold(),
            stationary_timeout_secs: default_stationary_timeout(),
            tick_interval_ms: default_motion_tick(),
        }
    }
}

fn default_motion_window() -> u64 {
    60
}

fn default_motion_threshold() -> f64 {
    50.0
}

fn default_stationary_timeout() -> u64 {
    300
}

fn default_motion_tick() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Upload endpoint (empty disables uploads)
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub authorization_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auto_sync: default_auto_sync(),
            batch_size: default_batch_size(),
            timeout_ms: default_http_timeout(),
            sync_interval_secs: default_sync_interval(),
            authorization_token: None,
        }
    }
}

fn default_auto_sync() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_http_timeout() -> u64 {
    60_000
}

fn default_sync_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for the outbox and state files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_max_days_to_persist")]
    pub max_days_to_persist: u32,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_days_to_persist: default_max_days_to_persist(),
            max_records: default_max_records(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_max_days_to_persist() -> u32 {
    14
}

fn default_max_records() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub geofences: Vec<Geofence>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    distance_filter: f64,
    stop_on_terminate: bool,
    start_on_boot: bool,
    minimum_fetch_interval_secs: u64,
    max_interval_secs: u64,
    provider_timeout_secs: u64,
    motion_window_secs: u64,
    motion_threshold_m: f64,
    stationary_timeout_secs: u64,
    motion_tick_interval_ms: u64,
    http_url: String,
    auto_sync: bool,
    batch_size: usize,
    http_timeout_ms: u64,
    sync_interval_secs: u64,
    authorization_token: Option<String>,
    data_dir: String,
    max_days_to_persist: u32,
    max_records: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    log_level: String,
    geofences: Vec<Geofence>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            distance_filter: toml_config.tracking.distance_filter,
            stop_on_terminate: toml_config.tracking.stop_on_terminate,
            start_on_boot: toml_config.tracking.start_on_boot,
            minimum_fetch_interval_secs: toml_config.tracking.minimum_fetch_interval_secs,
            max_interval_secs: toml_config.tracking.max_interval_secs,
            provider_timeout_secs: toml_config.provider.timeout_secs,
            motion_window_secs: toml_config.motion.window_secs,
            motion_threshold_m: toml_config.motion.motion_threshold_m,
            stationary_timeout_secs: toml_config.motion.stationary_timeout_secs,
            motion_tick_interval_ms: toml_config.motion.tick_interval_ms,
            http_url: toml_config.http.url,
            auto_sync: toml_config.http.auto_sync,
            batch_size: toml_config.http.batch_size,
            http_timeout_ms: toml_config.http.timeout_ms,
            sync_interval_secs: toml_config.http.sync_interval_secs,
            authorization_token: toml_config.http.authorization_token,
            data_dir: toml_config.persistence.data_dir,
            max_days_to_persist: toml_config.persistence.max_days_to_persist,
            max_records: toml_config.persistence.max_records,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            log_level: toml_config.logging.level,
            geofences: toml_config.geofences,
            config_file,
        }
    }

    /// Determine config file path from the `--config` flag or environment
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }

        // Check CONFIG_FILE environment variable
        match env::var("CONFIG_FILE") {
            Ok(path) if !path.is_empty() => path,
            _ => DEFAULT_CONFIG_PATH.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(cli: Option<&str>) -> Self {
        Self::load_from_path(Self::resolve_config_path(cli))
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.distance_filter.is_finite() && self.distance_filter >= 0.0) {
            return Err(ConfigError::InvalidDistanceFilter(self.distance_filter));
        }
        if !(self.motion_threshold_m.is_finite() && self.motion_threshold_m > 0.0) {
            return Err(ConfigError::InvalidMotionThreshold(self.motion_threshold_m));
        }
        let non_zero: [(&'static str, u64); 10] = [
            ("minimum_fetch_interval_secs", self.minimum_fetch_interval_secs),
            ("max_interval_secs", self.max_interval_secs),
            ("provider.timeout_secs", self.provider_timeout_secs),
            ("motion.window_secs", self.motion_window_secs),
            ("motion.stationary_timeout_secs", self.stationary_timeout_secs),
            ("motion.tick_interval_ms", self.motion_tick_interval_ms),
            ("http.timeout_ms", self.http_timeout_ms),
            ("http.sync_interval_secs", self.sync_interval_secs),
            ("max_days_to_persist", u64::from(self.max_days_to_persist)),
            ("metrics.interval_secs", self.metrics_interval_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("http.batch_size"));
        }
        if self.max_records == 0 {
            return Err(ConfigError::Zero("max_records"));
        }
        for fence in &self.geofences {
            fence.validate()?;
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn distance_filter(&self) -> f64 {
        self.distance_filter
    }

    pub fn stop_on_terminate(&self) -> bool {
        self.stop_on_terminate
    }

    pub fn start_on_boot(&self) -> bool {
        self.start_on_boot
    }

    pub fn minimum_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.minimum_fetch_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn motion_window(&self) -> Duration {
        Duration::from_secs(self.motion_window_secs)
    }

    pub fn motion_threshold_m(&self) -> f64 {
        self.motion_threshold_m
    }

    pub fn stationary_timeout(&self) -> Duration {
        Duration::from_secs(self.stationary_timeout_secs)
    }

    pub fn motion_tick_interval(&self) -> Duration {
        Duration::from_millis(self.motion_tick_interval_ms)
    }

    pub fn http_url(&self) -> &str {
        &self.http_url
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn authorization_token(&self) -> Option<&str> {
        self.authorization_token.as_deref()
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.data_dir)
    }

    pub fn outbox_file(&self) -> PathBuf {
        self.data_dir().join("outbox.jsonl")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn max_days_to_persist(&self) -> u32 {
        self.max_days_to_persist
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn geofences(&self) -> &[Geofence] {
        &self.geofences
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder methods for tests and embedding
    pub fn with_distance_filter(mut self, meters: f64) -> Self {
        self.distance_filter = meters;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_max_days_to_persist(mut self, days: u32) -> Self {
        self.max_days_to_persist = days;
        self
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_http_timeout_ms(mut self, ms: u64) -> Self {
        self.http_timeout_ms = ms;
        self
    }

    pub fn with_stop_on_terminate(mut self, stop: bool) -> Self {
        self.stop_on_terminate = stop;
        self
    }

    pub fn with_motion(mut self, window_secs: u64, threshold_m: f64, stationary_secs: u64) -> Self {
        self.motion_window_secs = window_secs;
        self.motion_threshold_m = threshold_m;
        self.stationary_timeout_secs = stationary_secs;
        self
    }

    pub fn with_geofences(mut self, geofences: Vec<Geofence>) -> Self {
        self.geofences = geofences;
        self
    }
}
