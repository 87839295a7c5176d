//! Snapshot fan-out hub
//!
//! Two broadcast channels carry `Arc<DataSnapshot>`: one for calibrated
//! snapshots (display, network, log) and one for raw snapshots (diagnostics,
//! calibration sessions). Sends never block the aggregator; a consumer that
//! falls behind the channel buffer recovers the calibrated snapshots it
//! missed from the shared [`SnapshotHistory`].

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::pipeline::{DataSnapshot, SnapshotHistory};

/// Broadcast senders plus the bounded history queue.
#[derive(Debug, Clone)]
pub struct SnapshotHub {
    calibrated: broadcast::Sender<Arc<DataSnapshot>>,
    raw: broadcast::Sender<Arc<DataSnapshot>>,
    history: Arc<SnapshotHistory>,
}

impl SnapshotHub {
    pub fn new(broadcast_capacity: usize, history_capacity: usize) -> Self {
        let capacity = broadcast_capacity.max(1);
        let (calibrated, _) = broadcast::channel(capacity);
        let (raw, _) = broadcast::channel(capacity);
        Self {
            calibrated,
            raw,
            history: Arc::new(SnapshotHistory::new(history_capacity)),
        }
    }

    pub fn history(&self) -> &Arc<SnapshotHistory> {
        &self.history
    }

    /// Latest calibrated snapshot, if any tick has completed.
    pub fn latest(&self) -> Option<Arc<DataSnapshot>> {
        self.history.latest()
    }

    /// Record the calibrated snapshot in history, then fan out both.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, raw: Arc<DataSnapshot>, calibrated: Arc<DataSnapshot>) {
        self.history.push(Arc::clone(&calibrated));
        let raw_receivers = self.raw.send(raw).unwrap_or(0);
        let receivers = self.calibrated.send(calibrated).unwrap_or(0);
        trace!(receivers, raw_receivers, "Snapshot fanned out");
    }

    /// Subscribe to calibrated snapshots with history catch-up on lag.
    /// Only snapshots emitted after this call are delivered.
    pub fn subscribe(&self) -> SnapshotSubscription {
        let start_after = self.history.latest().map(|s| s.sequence_index);
        SnapshotSubscription {
            rx: self.calibrated.subscribe(),
            history: Some(Arc::clone(&self.history)),
            start_after,
            last_sequence: None,
            backlog: VecDeque::new(),
        }
    }

    /// Subscribe to raw snapshots. Raw snapshots are not retained, so a
    /// lagging raw consumer simply skips ahead.
    pub fn subscribe_raw(&self) -> SnapshotSubscription {
        let start_after = self.history.latest().map(|s| s.sequence_index);
        SnapshotSubscription {
            rx: self.raw.subscribe(),
            history: None,
            start_after,
            last_sequence: None,
            backlog: VecDeque::new(),
        }
    }
}

/// Receiver that yields snapshots in strictly increasing sequence order.
#[derive(Debug)]
pub struct SnapshotSubscription {
    rx: broadcast::Receiver<Arc<DataSnapshot>>,
    history: Option<Arc<SnapshotHistory>>,
    /// Latest sequence index already emitted when the subscription was made
    start_after: Option<u64>,
    last_sequence: Option<u64>,
    backlog: VecDeque<Arc<DataSnapshot>>,
}

impl SnapshotSubscription {
    /// Next snapshot, or `None` once the hub is dropped.
    pub async fn recv(&mut self) -> Option<Arc<DataSnapshot>> {
        loop {
            if let Some(snapshot) = self.backlog.pop_front() {
                if self.accept(&snapshot) {
                    return Some(snapshot);
                }
                continue;
            }

            match self.rx.recv().await {
                Ok(snapshot) => {
                    if self.accept(&snapshot) {
                        return Some(snapshot);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.recover(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Sequence index of the last snapshot returned.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Newest sequence index this subscriber has seen or chose to skip.
    fn watermark(&self) -> Option<u64> {
        self.last_sequence.or(self.start_after)
    }

    /// Drop duplicates already delivered via catch-up, and anything emitted
    /// before the subscription.
    fn accept(&mut self, snapshot: &DataSnapshot) -> bool {
        if self
            .watermark()
            .is_some_and(|last| snapshot.sequence_index <= last)
        {
            return false;
        }
        self.last_sequence = Some(snapshot.sequence_index);
        true
    }

    fn recover(&mut self, skipped: u64) {
        let Some(history) = &self.history else {
            warn!(skipped, "Raw snapshot consumer lagged, skipping ahead");
            return;
        };

        let watermark = self.watermark();
        let missed = match watermark {
            Some(last) => history.since(last),
            None => history.to_vec(),
        };
        let first = missed.first().map(|s| s.sequence_index);
        let gap = match (watermark, first) {
            (Some(last), Some(first)) => first.saturating_sub(last + 1),
            _ => 0,
        };
        if gap > 0 {
            warn!(
                skipped,
                lost = gap,
                "Snapshot consumer lagged beyond history capacity"
            );
        } else {
            warn!(skipped, recovered = missed.len(), "Snapshot consumer lagged, replaying from history");
        }
        self.backlog.extend(missed);
    }
}
