//! Aggregated snapshot record handed to every consumer

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SourceKind;

/// One source's contribution to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub valid: bool,
    /// Channel values; all zeros when `valid` is false
    pub channels: Vec<f64>,
}

impl SourceSnapshot {
    pub fn invalid(channels: usize) -> Self {
        Self {
            valid: false,
            channels: vec![0.0; channels],
        }
    }
}

/// Immutable, timestamped, sequence-indexed aggregation of every source.
///
/// The aggregator emits each tick twice with the same timestamp and
/// sequence index: once with raw values (`calibrated == false`) for
/// diagnostic and calibration-session consumers, once calibrated for
/// everyone else. Consumers share it read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    /// Logical time in seconds: `tick_count * 0.1`
    pub timestamp: f64,
    pub sequence_index: u64,
    /// Wall-clock time the tick fired, for cross-system correlation only
    pub wall_clock: DateTime<Utc>,
    pub calibrated: bool,
    pub sources: BTreeMap<SourceKind, SourceSnapshot>,
    /// Cross-source computed channels in configuration order
    pub computed: Vec<f64>,
}

impl DataSnapshot {
    /// Validity flag of `kind`; unconfigured sources are invalid.
    pub fn is_valid(&self, kind: SourceKind) -> bool {
        self.sources.get(&kind).is_some_and(|s| s.valid)
    }

    /// Channel vector of `kind`; empty for unconfigured sources.
    pub fn channels(&self, kind: SourceKind) -> &[f64] {
        self.sources
            .get(&kind)
            .map_or(&[][..], |s| s.channels.as_slice())
    }

    /// Validity keyed by source section name.
    pub fn per_source_validity(&self) -> BTreeMap<&'static str, bool> {
        self.sources
            .iter()
            .map(|(k, s)| (k.section_name(), s.valid))
            .collect()
    }

    /// Channel vectors keyed by source section name.
    pub fn per_source_channels(&self) -> BTreeMap<&'static str, &[f64]> {
        self.sources
            .iter()
            .map(|(k, s)| (k.section_name(), s.channels.as_slice()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataSnapshot {
        let mut sources = BTreeMap::new();
        sources.insert(
            SourceKind::Modbus,
            SourceSnapshot {
                valid: true,
                channels: vec![1.0, 2.0],
            },
        );
        sources.insert(SourceKind::Daq, SourceSnapshot::invalid(3));
        DataSnapshot {
            timestamp: 0.3,
            sequence_index: 3,
            wall_clock: Utc::now(),
            calibrated: true,
            sources,
            computed: vec![0.0],
        }
    }

    #[test]
    fn test_accessors() {
        let s = sample();
        assert!(s.is_valid(SourceKind::Modbus));
        assert!(!s.is_valid(SourceKind::Daq));
        assert!(!s.is_valid(SourceKind::Serial));
        assert_eq!(s.channels(SourceKind::Daq), &[0.0, 0.0, 0.0]);
        assert!(s.channels(SourceKind::Serial).is_empty());
        assert!(s.per_source_validity()["Modbus"]);
        assert_eq!(s.per_source_channels()["DAQ"].len(), 3);
    }

    #[test]
    fn test_json_keys_are_source_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json["sources"]["modbus"]["valid"].as_bool().unwrap());
        assert_eq!(json["sequence_index"], 3);
    }
}
