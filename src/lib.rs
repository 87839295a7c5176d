//! Sensor-Sync: multi-source snapshot synchronization and calibration
//!
//! Three independently clocked hardware sources are reconciled onto one
//! fixed 100 ms timeline, low-pass filtered, corrected by per-channel cubic
//! calibration, and fanned out as immutable, sequence-indexed snapshots.
//!
//! ## Architecture
//!
//! - **Acquisition**: one ingestion adapter thread per source (polled bus,
//!   streaming analog card, framed telemetry link)
//! - **Pipeline**: single-writer source slots, the tick aggregator, history
//! - **Calibration**: least-squares fitting, hot-swappable coefficient store,
//!   operator sessions, file watcher
//! - **Distribution**: broadcast hub, CSV log, UDP JSON broadcast

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod distribution;
pub mod pipeline;
pub mod processing;
pub mod types;

// Re-export configuration
pub use config::PipelineConfig;

// Re-export commonly used types
pub use types::{
    CalibrationParams, CalibrationPoint, ChannelRef, ComputedChannel, ComputedOp,
    RawChannelVector, SourceKind,
};

// Re-export the pipeline surface
pub use pipeline::{Aggregator, AggregatorState, DataSnapshot, SourceRegistry};

// Re-export calibration components
pub use calibration::{
    fit_polynomial, CalibrationError, CalibrationSession, CalibrationStore, CalibrationTable,
};

pub use distribution::{SnapshotHub, SnapshotSubscription};
