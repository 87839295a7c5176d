//! System-wide default constants.
//!
//! Centralises magic numbers used across the pipeline.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Aggregator
// ============================================================================

/// Wall-clock period between aggregator ticks (ms).
pub const TICK_INTERVAL_MS: u64 = 100;

/// Logical time advanced per tick (seconds).
///
/// Timestamps are `tick_count * LOGICAL_TICK_SECS`, independent of when the
/// tick actually fired.
pub const LOGICAL_TICK_SECS: f64 = 0.1;

/// Calibrated snapshots retained for lagging consumers.
///
/// 300 snapshots at 10 Hz = 30 seconds.
pub const HISTORY_CAPACITY: usize = 300;

/// A source whose last publish is older than this is reported invalid (ms).
pub const STALE_AFTER_MS: u64 = 1_000;

/// Capacity of each fan-out broadcast channel (snapshots).
pub const BROADCAST_CAPACITY: usize = 64;

// ============================================================================
// Filter
// ============================================================================

/// Default low-pass time constant (seconds).
pub const FILTER_TIME_CONSTANT_SECS: f64 = 0.5;

// ============================================================================
// Sources
// ============================================================================

/// Register-bus scan period (ms).
pub const MODBUS_POLL_INTERVAL_MS: u64 = 200;

/// Analog card batch period (ms).
pub const DAQ_BATCH_INTERVAL_MS: u64 = 20;

/// Mean interval between telemetry frames (ms).
pub const SERIAL_FRAME_INTERVAL_MS: u64 = 250;

/// Sample rate of the simulated analog card (Hz).
pub const SIMULATED_DAQ_RATE_HZ: f64 = 1_000.0;

pub const MODBUS_CHANNELS: usize = 4;
pub const DAQ_CHANNELS: usize = 8;
pub const SERIAL_CHANNELS: usize = 3;

// ============================================================================
// Calibration
// ============================================================================

/// Calibration file name, relative to the working directory.
pub const CALIBRATION_FILE_NAME: &str = "calibration.ini";

/// Raw snapshots averaged per calibration point (10 ticks = 1 s).
pub const SESSION_WINDOW_TICKS: usize = 10;

/// Interval between calibration file mtime checks (ms).
pub const CALIBRATION_POLL_INTERVAL_MS: u64 = 2_000;

/// Debounce after a calibration file change before reloading (ms).
pub const CALIBRATION_DEBOUNCE_MS: u64 = 500;

// ============================================================================
// Log
// ============================================================================

/// Snapshot log file name, relative to the working directory.
pub const LOG_FILE_NAME: &str = "snapshots.csv";

/// Decimal places for computed channels in the snapshot log.
pub const COMPUTED_LOG_PRECISION: usize = 4;
