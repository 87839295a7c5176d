//! Calibration Session
//!
//! Operator-driven collection of reference points for one source:
//!
//! ```text
//!   begin_collection()
//!        │
//!        ▼
//!   observe(raw snapshot) × window ──▶ add_point(standard)  (repeat per standard)
//!        │
//!        ▼
//!   fit() ──▶ commit(store, path)  (save + reload)
//! ```
//!
//! Only raw (pre-calibration) snapshots with the source valid are averaged,
//! so a point always relates the sensor's uncorrected reading to the
//! reference standard.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use tracing::{debug, info, warn};

use super::fit::fit_with_summary;
use super::{CalibrationError, CalibrationStore};
use crate::distribution::SnapshotSubscription;
use crate::pipeline::DataSnapshot;
use crate::types::{CalibrationParams, CalibrationPoint, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting,
}

#[derive(Debug)]
pub struct CalibrationSession {
    source: SourceKind,
    window: usize,
    state: SessionState,
    /// Most recent raw samples per channel, at most `window` long
    buffers: BTreeMap<usize, VecDeque<f64>>,
    points: BTreeMap<usize, Vec<CalibrationPoint>>,
}

impl CalibrationSession {
    /// Session over `channels` of `source`, averaging `window_ticks` raw
    /// snapshots per point.
    pub fn new(source: SourceKind, channels: impl IntoIterator<Item = usize>, window_ticks: usize) -> Self {
        let channels: Vec<usize> = channels.into_iter().collect();
        let window = window_ticks.max(1);
        Self {
            source,
            window,
            state: SessionState::Idle,
            buffers: channels
                .iter()
                .map(|&ch| (ch, VecDeque::with_capacity(window)))
                .collect(),
            points: channels.iter().map(|&ch| (ch, Vec::new())).collect(),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.points.keys().copied()
    }

    /// Start (or restart) averaging. Previously added points are kept.
    pub fn begin_collection(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
        self.state = SessionState::Collecting;
        info!(source = %self.source, window = self.window, "Calibration collection started");
    }

    pub fn end_collection(&mut self) {
        self.state = SessionState::Idle;
    }

    /// Feed one snapshot. Returns `true` if it was used.
    ///
    /// Ignored unless collecting, the snapshot is raw, the source is valid,
    /// and every session channel is present.
    pub fn observe(&mut self, snapshot: &DataSnapshot) -> bool {
        if self.state != SessionState::Collecting
            || snapshot.calibrated
            || !snapshot.is_valid(self.source)
        {
            return false;
        }

        let values = snapshot.channels(self.source);
        if self.buffers.keys().any(|&ch| ch >= values.len()) {
            debug!(
                source = %self.source,
                channels = values.len(),
                "Snapshot lacks a session channel, skipped"
            );
            return false;
        }

        for (&ch, buffer) in &mut self.buffers {
            if buffer.len() == self.window {
                buffer.pop_front();
            }
            buffer.push_back(values[ch]);
        }
        true
    }

    /// Samples available for the next point (the shortest channel buffer).
    pub fn samples_collected(&self) -> usize {
        self.buffers.values().map(VecDeque::len).min().unwrap_or(0)
    }

    pub fn is_window_full(&self) -> bool {
        self.samples_collected() >= self.window
    }

    /// Average the collection window of every channel against `standard`
    /// and append one point per channel. The window is cleared so the next
    /// point uses fresh samples. Returns the new point count.
    pub fn add_point(&mut self, standard: f64) -> Result<usize, CalibrationError> {
        if self.state != SessionState::Collecting {
            return Err(CalibrationError::NotCollecting);
        }
        let have = self.samples_collected();
        if have < self.window {
            return Err(CalibrationError::CollectionIncomplete {
                have,
                need: self.window,
            });
        }

        for (&ch, buffer) in &mut self.buffers {
            let raw_average = buffer.iter().sum::<f64>() / buffer.len() as f64;
            buffer.clear();
            if let Some(points) = self.points.get_mut(&ch) {
                points.push(CalibrationPoint::new(raw_average, standard));
            }
            debug!(source = %self.source, channel = ch, raw_average, standard, "Calibration point added");
        }

        let count = self.points.values().map(Vec::len).max().unwrap_or(0);
        info!(source = %self.source, standard, points = count, "Calibration point recorded");
        Ok(count)
    }

    /// Fill a fresh window from `rx` (raw snapshots) and add the point.
    pub async fn collect_point(
        &mut self,
        rx: &mut SnapshotSubscription,
        standard: f64,
    ) -> Result<usize, CalibrationError> {
        if self.state != SessionState::Collecting {
            return Err(CalibrationError::NotCollecting);
        }
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }

        while !self.is_window_full() {
            let snapshot = rx.recv().await.ok_or(CalibrationError::StreamClosed)?;
            self.observe(&snapshot);
        }
        self.add_point(standard)
    }

    /// Drop the most recent point of every channel. Returns `false` if there
    /// was nothing to remove.
    pub fn remove_last_point(&mut self) -> bool {
        let mut removed = false;
        for points in self.points.values_mut() {
            removed |= points.pop().is_some();
        }
        removed
    }

    pub fn clear_points(&mut self) {
        for points in self.points.values_mut() {
            points.clear();
        }
    }

    /// Points recorded for `channel` (0 for channels outside the session).
    pub fn point_count(&self, channel: usize) -> usize {
        self.points.get(&channel).map_or(0, Vec::len)
    }

    pub fn points(&self, channel: usize) -> Result<&[CalibrationPoint], CalibrationError> {
        self.points
            .get(&channel)
            .map(Vec::as_slice)
            .ok_or(CalibrationError::UnknownChannel { channel })
    }

    /// Fit every channel independently.
    ///
    /// Refuses before fitting anything if any channel has fewer than two
    /// points.
    pub fn fit(&self) -> Result<BTreeMap<usize, CalibrationParams>, CalibrationError> {
        if let Some((&channel, points)) = self.points.iter().find(|(_, p)| p.len() < 2) {
            warn!(source = %self.source, channel, have = points.len(), "Not enough calibration points to fit");
            return Err(CalibrationError::InsufficientPoints {
                channel,
                have: points.len(),
            });
        }

        self.points
            .iter()
            .map(|(&channel, points)| {
                let summary = fit_with_summary(points).map_err(|e| match e {
                    CalibrationError::InsufficientPoints { have, .. } => {
                        CalibrationError::InsufficientPoints { channel, have }
                    }
                    other => other,
                })?;
                info!(
                    source = %self.source,
                    channel,
                    degree = summary.degree,
                    singular = summary.singular,
                    rms_residual = summary.rms_residual,
                    "Channel fitted"
                );
                Ok((channel, summary.params))
            })
            .collect()
    }

    /// Fit, merge into `store`, persist to `path`, and hot-reload.
    /// A failure at any step leaves the active table unchanged.
    pub fn commit(&self, store: &CalibrationStore, path: &Path) -> Result<usize, CalibrationError> {
        let params = self.fit()?;
        store.commit(path, self.source.section_name(), &params)
    }
}
