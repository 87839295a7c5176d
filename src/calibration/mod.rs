//! Calibration subsystem
//!
//! - [`fit`]: least-squares polynomial fitting (degree ≤ 3) from reference points
//! - [`store`]: per-(source, channel) coefficient table with atomic hot-swap
//! - [`session`]: operator-driven point collection, fitting, and commit
//! - [`watcher`]: mtime-polling hot reload of the calibration file

pub mod fit;
pub mod session;
pub mod store;
pub mod watcher;

pub use fit::{fit_polynomial, fit_with_summary, FitSummary};
pub use session::{CalibrationSession, SessionState};
pub use store::{CalibrationEntry, CalibrationStore, CalibrationTable, ParseIssue};
pub use watcher::{run_calibration_watcher, spawn_calibration_watcher, CalibrationEvent, WatchTiming};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised at the calibration session and store boundaries.
///
/// Numerical failures inside the fitting engine are not errors: a singular
/// system resolves to the identity transform.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Calibration file I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Insufficient calibration points for channel {channel}: have {have}, need at least 2")]
    InsufficientPoints { channel: usize, have: usize },

    #[error("Collection window incomplete: have {have} samples, need {need}")]
    CollectionIncomplete { have: usize, need: usize },

    #[error("No collection in progress, call begin_collection() first")]
    NotCollecting,

    #[error("Channel {channel} is not part of this session")]
    UnknownChannel { channel: usize },

    #[error("Raw snapshot stream closed before the collection window filled")]
    StreamClosed,
}
