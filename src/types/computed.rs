//! Cross-source computed channel definitions

use serde::{Deserialize, Serialize};

use super::ChannelRef;

/// Binary operation combining two channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComputedOp {
    Product,
    Sum,
    Difference,
    /// `lhs / rhs`; a zero denominator yields 0
    Ratio,
}

impl ComputedOp {
    pub fn evaluate(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ComputedOp::Product => lhs * rhs,
            ComputedOp::Sum => lhs + rhs,
            ComputedOp::Difference => lhs - rhs,
            ComputedOp::Ratio => {
                if rhs == 0.0 {
                    0.0
                } else {
                    lhs / rhs
                }
            }
        }
    }
}

/// A channel derived from one channel of each of two sources, e.g. a power
/// reading from a bus voltage and a card current.
///
/// Only evaluated when both contributing sources are valid; otherwise 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedChannel {
    pub name: String,
    pub op: ComputedOp,
    pub lhs: ChannelRef,
    pub rhs: ChannelRef,
}
