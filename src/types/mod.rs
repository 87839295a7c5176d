//! Shared data structures for the snapshot synchronization pipeline
//!
//! - Sources: `SourceKind`, `RawChannelVector`, `ChannelRef`
//! - Calibration: `CalibrationPoint`, `CalibrationParams`
//! - Computed channels: `ComputedChannel`, `ComputedOp`

mod source;
mod calibration;
mod computed;

pub use source::*;
pub use calibration::*;
pub use computed::*;
