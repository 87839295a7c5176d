//! Bounded FIFO of recent calibrated snapshots for consumers that lag

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::DataSnapshot;

/// Most recent `capacity` snapshots, oldest evicted first.
#[derive(Debug)]
pub struct SnapshotHistory {
    entries: Mutex<VecDeque<Arc<DataSnapshot>>>,
    capacity: usize,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn push(&self, snapshot: Arc<DataSnapshot>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<Arc<DataSnapshot>> {
        self.entries.lock().back().cloned()
    }

    /// Retained snapshots with `sequence_index > after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<Arc<DataSnapshot>> {
        self.entries
            .lock()
            .iter()
            .filter(|s| s.sequence_index > after)
            .cloned()
            .collect()
    }

    /// All retained snapshots, oldest first.
    pub fn to_vec(&self) -> Vec<Arc<DataSnapshot>> {
        self.entries.lock().iter().cloned().collect()
    }
}
