//! Pipeline Configuration - sources, filter, aggregator, and calibration settings
//!
//! Every struct implements `Default`, so a missing file or a partial file
//! yields a runnable three-source configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::types::{ComputedChannel, SourceKind};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "SENSOR_SYNC_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "sensor_sync.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one acquisition station.
///
/// Load with `PipelineConfig::load()` which searches:
/// 1. `$SENSOR_SYNC_CONFIG` env var
/// 2. `./sensor_sync.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tick cadence, history, and staleness
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Low-pass filter applied by every publisher
    #[serde(default)]
    pub filter: FilterConfig,

    /// Configured ingestion sources
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Cross-source computed channels
    #[serde(default)]
    pub computed: Vec<ComputedChannel>,

    /// Calibration file location and hot reload
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Calibration session collection window
    #[serde(default)]
    pub session: SessionConfig,

    /// Durable snapshot log
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            filter: FilterConfig::default(),
            sources: default_sources(),
            computed: Vec::new(),
            calibration: CalibrationConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_sources() -> Vec<SourceConfig> {
    SourceKind::ALL.into_iter().map(SourceConfig::for_kind).collect()
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SENSOR_SYNC_CONFIG` environment variable
    /// 2. `./sensor_sync.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), sources = config.sources.len(), "Loaded pipeline config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./sensor_sync.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(sources = config.sources.len(), "Loaded pipeline config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Channel count configured for `kind`, if the source is configured.
    pub fn channel_count(&self, kind: SourceKind) -> Option<usize> {
        self.source(kind).map(|s| s.channel_count)
    }

    pub fn source(&self, kind: SourceKind) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.kind == kind)
    }

    /// Validate the configuration for internal consistency.
    ///
    /// Rules:
    /// - Each source kind appears at most once and has at least one channel
    /// - Tick interval and history capacity are non-zero
    /// - Filter time constant is finite and non-negative
    /// - Computed channels reference configured sources and in-range channels
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.aggregator.tick_interval_ms == 0 {
            errors.push("aggregator.tick_interval_ms must be > 0".to_string());
        }
        if self.aggregator.history_capacity == 0 {
            errors.push("aggregator.history_capacity must be > 0".to_string());
        }
        if self.aggregator.broadcast_capacity == 0 {
            errors.push("aggregator.broadcast_capacity must be > 0".to_string());
        }

        let tau = self.filter.time_constant_secs;
        if !tau.is_finite() || tau < 0.0 {
            errors.push(format!(
                "filter.time_constant_secs must be finite and >= 0 (got {tau})"
            ));
        }

        if self.session.window_ticks == 0 {
            errors.push("session.window_ticks must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.kind) {
                errors.push(format!("sources: '{}' configured more than once", source.kind));
            }
            if source.channel_count == 0 {
                errors.push(format!("sources.{}: channel_count must be > 0", source.kind));
            }
        }

        for computed in &self.computed {
            for side in [computed.lhs, computed.rhs] {
                match self.channel_count(side.source) {
                    None => errors.push(format!(
                        "computed.{}: source '{}' is not configured",
                        computed.name, side.source
                    )),
                    Some(count) if side.channel >= count => errors.push(format!(
                        "computed.{}: channel {} out of range for '{}' ({} channels)",
                        computed.name, side.channel, side.source, count
                    )),
                    Some(_) => {}
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Wall-clock tick period in ms (logical step stays 0.1 s)
    pub tick_interval_ms: u64,
    /// Calibrated snapshots retained for lagging consumers
    pub history_capacity: usize,
    /// Age after which a source is reported invalid (ms)
    pub stale_after_ms: u64,
    /// Per-channel broadcast buffer (snapshots)
    pub broadcast_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: defaults::TICK_INTERVAL_MS,
            history_capacity: defaults::HISTORY_CAPACITY,
            stale_after_ms: defaults::STALE_AFTER_MS,
            broadcast_capacity: defaults::BROADCAST_CAPACITY,
        }
    }
}

impl AggregatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub time_constant_secs: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_constant_secs: defaults::FILTER_TIME_CONSTANT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub channel_count: usize,
    /// Scan / batch / frame period for this source (ms); per-kind default
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl SourceConfig {
    pub fn for_kind(kind: SourceKind) -> Self {
        let channel_count = match kind {
            SourceKind::Modbus => defaults::MODBUS_CHANNELS,
            SourceKind::Daq => defaults::DAQ_CHANNELS,
            SourceKind::Serial => defaults::SERIAL_CHANNELS,
        };
        Self {
            kind,
            channel_count,
            interval_ms: None,
        }
    }

    pub fn interval(&self) -> Duration {
        let ms = self.interval_ms.unwrap_or(match self.kind {
            SourceKind::Modbus => defaults::MODBUS_POLL_INTERVAL_MS,
            SourceKind::Daq => defaults::DAQ_BATCH_INTERVAL_MS,
            SourceKind::Serial => defaults::SERIAL_FRAME_INTERVAL_MS,
        });
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub path: PathBuf,
    /// Poll the file for changes and hot-reload
    pub watch: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::CALIBRATION_FILE_NAME),
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Raw snapshots averaged into one calibration point
    pub window_ticks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_ticks: defaults::SESSION_WINDOW_TICKS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(defaults::LOG_FILE_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.aggregator.history_capacity, 300);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
[filter]
time_constant_secs = 1.5
"#,
        )
        .unwrap();
        assert_eq!(config.filter.time_constant_secs, 1.5);
        assert!(config.filter.enabled);
        assert_eq!(config.aggregator.tick_interval_ms, 100);
        assert_eq!(config.channel_count(SourceKind::Daq), Some(defaults::DAQ_CHANNELS));
    }

    #[test]
    fn test_full_toml_with_computed_channel() {
        let config = PipelineConfig::from_toml(
            r#"
[aggregator]
history_capacity = 50

[[sources]]
kind = "modbus"
channel_count = 2
interval_ms = 500

[[sources]]
kind = "daq"
channel_count = 4

[[computed]]
name = "power"
op = "product"
lhs = { source = "modbus", channel = 1 }
rhs = { source = "daq", channel = 3 }
"#,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.source(SourceKind::Modbus).unwrap().interval(), Duration::from_millis(500));
        assert_eq!(config.computed[0].name, "power");
        assert!(config.source(SourceKind::Serial).is_none());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = PipelineConfig::default();
        config.aggregator.history_capacity = 0;
        config.filter.time_constant_secs = f64::NAN;
        config.sources.push(SourceConfig::for_kind(SourceKind::Daq));
        config.sources[0].channel_count = 0;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 4, "{errors:?}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_computed_channel_out_of_range_rejected() {
        let err = PipelineConfig::from_toml(
            r#"
[[sources]]
kind = "modbus"
channel_count = 2

[[computed]]
name = "bad"
op = "sum"
lhs = { source = "modbus", channel = 2 }
rhs = { source = "serial", channel = 0 }
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("out of range"), "{msg}");
        assert!(msg.contains("not configured"), "{msg}");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();
        let back = PipelineConfig::from_toml(&text).unwrap();
        assert_eq!(back.sources.len(), config.sources.len());
        assert_eq!(back.calibration.path, config.calibration.path);
    }
}
