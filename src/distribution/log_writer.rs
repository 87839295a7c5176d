//! Durable CSV snapshot log
//!
//! Columns: `timestamp, sequence, <Source>_valid..., <Source>_<n>...,
//! <computed>...`. Channel precision is fixed per source kind (bus 4,
//! analog card 6, telemetry 2, computed 4). Invalid sources log their
//! zero-filled values like any other.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DistributionError, SnapshotSubscription};
use crate::config::{defaults, PipelineConfig};
use crate::pipeline::DataSnapshot;
use crate::types::SourceKind;

pub struct SnapshotLogWriter<W: Write> {
    out: W,
    /// Configured sources and channel counts, in column order
    layout: Vec<(SourceKind, usize)>,
    computed: Vec<String>,
    rows: u64,
}

impl<W: Write> SnapshotLogWriter<W> {
    pub fn new(out: W, config: &PipelineConfig) -> Self {
        let mut layout: Vec<_> = config
            .sources
            .iter()
            .map(|s| (s.kind, s.channel_count))
            .collect();
        layout.sort_by_key(|(kind, _)| *kind);
        Self {
            out,
            layout,
            computed: config.computed.iter().map(|c| c.name.clone()).collect(),
            rows: 0,
        }
    }

    pub fn header(&self) -> String {
        let mut cols = vec!["timestamp".to_string(), "sequence".to_string()];
        cols.extend(
            self.layout
                .iter()
                .map(|(kind, _)| format!("{}_valid", kind.section_name())),
        );
        for (kind, count) in &self.layout {
            cols.extend((0..*count).map(|ch| format!("{}_{ch}", kind.section_name())));
        }
        cols.extend(self.computed.iter().cloned());
        cols.join(",")
    }

    pub fn write_header(&mut self) -> std::io::Result<()> {
        let header = self.header();
        writeln!(self.out, "{header}")
    }

    /// Format one row. Channels missing from the snapshot are written as 0.
    pub fn format_row(&self, snapshot: &DataSnapshot) -> String {
        let mut row = format!("{:.1},{}", snapshot.timestamp, snapshot.sequence_index);

        for (kind, _) in &self.layout {
            let _ = write!(row, ",{}", u8::from(snapshot.is_valid(*kind)));
        }

        for (kind, count) in &self.layout {
            let precision = kind.log_precision();
            let values = snapshot.channels(*kind);
            for ch in 0..*count {
                let v = values.get(ch).copied().unwrap_or(0.0);
                let _ = write!(row, ",{v:.precision$}");
            }
        }

        for i in 0..self.computed.len() {
            let v = snapshot.computed.get(i).copied().unwrap_or(0.0);
            let _ = write!(row, ",{v:.prec$}", prec = defaults::COMPUTED_LOG_PRECISION);
        }

        row
    }

    pub fn write_snapshot(&mut self, snapshot: &DataSnapshot) -> std::io::Result<()> {
        let row = self.format_row(snapshot);
        writeln!(self.out, "{row}")?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Append calibrated snapshots from `rx` to the CSV file at `path` until
/// `cancel` fires or the hub closes. A header is written when the file is
/// new or empty.
pub async fn run_snapshot_log(
    path: PathBuf,
    config: PipelineConfig,
    mut rx: SnapshotSubscription,
    cancel: CancellationToken,
) -> Result<u64, DistributionError> {
    let io_err = |source: std::io::Error| DistributionError::LogIo {
        path: path.clone(),
        source,
    };

    let needs_header = std::fs::metadata(&path).map_or(true, |m| m.len() == 0);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err)?;
    let mut writer = SnapshotLogWriter::new(BufWriter::new(file), &config);
    if needs_header {
        writer.write_header().map_err(io_err)?;
    }
    info!(path = %path.display(), "Snapshot log started");

    loop {
        let snapshot = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(s) => s,
                None => {
                    debug!("Snapshot hub closed, stopping log");
                    break;
                }
            },
        };

        if let Err(e) = writer.write_snapshot(&snapshot).and_then(|()| writer.flush()) {
            warn!(error = %e, seq = snapshot.sequence_index, "Failed to write snapshot log row");
            return Err(io_err(e));
        }
    }

    writer.flush().map_err(io_err)?;
    info!(path = %path.display(), rows = writer.rows(), "Snapshot log stopped");
    Ok(writer.rows())
}
