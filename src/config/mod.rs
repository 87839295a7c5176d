//! Pipeline Configuration Module
//!
//! Source layout, filter, aggregator, and computed-channel settings loaded
//! from TOML.
//!
//! ## Loading Order
//!
//! 1. `SENSOR_SYNC_CONFIG` environment variable (path to TOML file)
//! 2. `sensor_sync.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded [`PipelineConfig`] is passed explicitly to the components that
//! need it; there is no global instance.

mod pipeline_config;
pub mod defaults;

pub use pipeline_config::*;
