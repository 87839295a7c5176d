//! Snapshot Pipeline
//!
//! ```text
//!  Modbus adapter ──publish──▶ ┌──────────────┐
//!  DAQ adapter    ──publish──▶ │ SourceRegistry│ (one slot per source,
//!  Serial adapter ──publish──▶ └──────┬───────┘  filtered latest value)
//!                                     │ read (never waits on adapters)
//!                              ┌──────▼───────┐
//!                              │  Aggregator  │ every 100 ms
//!                              └──────┬───────┘
//!                                     │ raw + calibrated DataSnapshot
//!                              ┌──────▼───────┐
//!                              │ SnapshotHub  │ broadcast + history
//!                              └──────────────┘
//! ```

mod aggregator;
mod history;
mod slots;
mod snapshot;

pub use aggregator::{Aggregator, AggregatorState};
pub use history::SnapshotHistory;
pub use slots::{SlotReading, SourcePublisher, SourceRegistry};
pub use snapshot::{DataSnapshot, SourceSnapshot};

use thiserror::Error;

use crate::types::SourceKind;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Aggregator must be enabled from within a tokio runtime")]
    NoRuntime,
}

/// A computed channel that could not be evaluated on a tick. The channel
/// reports 0 for that tick; the snapshot is still emitted.
#[derive(Error, Debug)]
pub enum ComputedChannelError {
    #[error("Computed channel '{name}': channel {channel} of {kind} out of range ({len} channels published)")]
    ChannelOutOfRange {
        name: String,
        kind: SourceKind,
        channel: usize,
        len: usize,
    },
}
