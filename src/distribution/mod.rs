//! Distribution fan-out
//!
//! [`SnapshotHub`] is the single publication point for snapshots. Consumers
//! subscribe independently and never slow the aggregator down:
//!
//! - [`SnapshotLogWriter`]: durable CSV log, one row per calibrated snapshot
//! - [`UdpBroadcaster`]: one JSON datagram per calibrated snapshot

mod broadcaster;
mod hub;
mod log_writer;

pub use broadcaster::{run_broadcaster, SnapshotMessage, UdpBroadcaster};
pub use hub::{SnapshotHub, SnapshotSubscription};
pub use log_writer::{run_snapshot_log, SnapshotLogWriter};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("Snapshot log I/O error ({}): {source}", .path.display())]
    LogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Broadcast socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
