//! Source identification and raw channel vectors

use serde::{Deserialize, Serialize};

/// One of the three independently-clocked ingestion paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Polled register bus (bus scan on command)
    Modbus,
    /// Continuously-sampled multi-channel analog acquisition card
    Daq,
    /// Framed serial telemetry link
    Serial,
}

impl SourceKind {
    /// All source kinds in snapshot column order.
    pub const ALL: [SourceKind; 3] = [SourceKind::Modbus, SourceKind::Daq, SourceKind::Serial];

    /// Section name used in the calibration file and in snapshot maps.
    pub fn section_name(&self) -> &'static str {
        match self {
            SourceKind::Modbus => "Modbus",
            SourceKind::Daq => "DAQ",
            SourceKind::Serial => "Serial",
        }
    }

    /// Decimal places used when a channel of this source is written to the log.
    pub fn log_precision(&self) -> usize {
        match self {
            SourceKind::Modbus => 4,
            SourceKind::Daq => 6,
            SourceKind::Serial => 2,
        }
    }

    /// Resolve a calibration-file section name (case-insensitive).
    pub fn from_section_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.section_name().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.section_name())
    }
}

/// Latest readings of one source: one value per configured channel plus a
/// flag meaning "this source has produced at least one sample and is active".
///
/// Replaced wholesale on every sample batch, never mutated in place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawChannelVector {
    pub values: Vec<f64>,
    pub active: bool,
}

impl RawChannelVector {
    pub fn new(values: Vec<f64>, active: bool) -> Self {
        Self { values, active }
    }

    /// An inactive vector of `channels` zeros.
    pub fn inactive(channels: usize) -> Self {
        Self {
            values: vec![0.0; channels],
            active: false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Reference to one channel of one source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub source: SourceKind,
    pub channel: usize,
}

impl ChannelRef {
    pub const fn new(source: SourceKind, channel: usize) -> Self {
        Self { source, channel }
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.channel)
    }
}
