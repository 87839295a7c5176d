//! Per-source latest-value slots
//!
//! Each configured source owns one mutex-guarded slot holding its most
//! recently published (filtered) channel vector. The slot has exactly one
//! writer, the [`SourcePublisher`] handed out by the [`SourceRegistry`], and
//! any number of readers taking [`SlotReading`] copies.
//!
//! The lock is held only for the copy in or out of the slot; neither side
//! ever waits on the other for longer than that.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::acquisition::AcquisitionError;
use crate::config::{FilterConfig, PipelineConfig, SourceConfig};
use crate::processing::LowPassFilter;
use crate::types::{RawChannelVector, SourceKind};

/// Copy of a slot's contents at the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotReading {
    pub vector: RawChannelVector,
    /// Monotonic time of the last publish, `None` if never published
    pub updated_at: Option<Instant>,
    /// Total publishes since the registry was created
    pub publishes: u64,
}

impl SlotReading {
    /// A source is valid when its adapter reports it active and the last
    /// publish is no older than `stale_after`.
    pub fn is_valid(&self, now: Instant, stale_after: Duration) -> bool {
        self.vector.active
            && self
                .updated_at
                .is_some_and(|t| now.saturating_duration_since(t) <= stale_after)
    }
}

#[derive(Debug)]
struct SlotState {
    vector: RawChannelVector,
    updated_at: Option<Instant>,
    publishes: u64,
}

#[derive(Debug)]
struct SourceSlot {
    kind: SourceKind,
    channel_count: usize,
    state: Mutex<SlotState>,
    writer_taken: AtomicBool,
}

impl SourceSlot {
    fn new(config: &SourceConfig) -> Self {
        Self {
            kind: config.kind,
            channel_count: config.channel_count,
            state: Mutex::new(SlotState {
                vector: RawChannelVector::inactive(config.channel_count),
                updated_at: None,
                publishes: 0,
            }),
            writer_taken: AtomicBool::new(false),
        }
    }

    fn read(&self) -> SlotReading {
        let state = self.state.lock();
        SlotReading {
            vector: state.vector.clone(),
            updated_at: state.updated_at,
            publishes: state.publishes,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Aggregator-owned registry of source slots.
///
/// Adapters receive their [`SourcePublisher`] from here at construction;
/// there is no ambient global state.
#[derive(Debug)]
pub struct SourceRegistry {
    slots: BTreeMap<SourceKind, Arc<SourceSlot>>,
    filter: FilterConfig,
}

impl SourceRegistry {
    pub fn new(sources: &[SourceConfig], filter: FilterConfig) -> Self {
        let slots = sources
            .iter()
            .map(|s| (s.kind, Arc::new(SourceSlot::new(s))))
            .collect();
        Self { slots, filter }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.sources, config.filter.clone())
    }

    /// Hand out the single writer for `kind`.
    ///
    /// Fails if the source is not configured or its publisher is already
    /// held. Dropping the publisher releases the writer role.
    pub fn publisher(&self, kind: SourceKind) -> Result<SourcePublisher, AcquisitionError> {
        let slot = self
            .slots
            .get(&kind)
            .ok_or(AcquisitionError::NotConfigured(kind))?;
        if slot.writer_taken.swap(true, Ordering::AcqRel) {
            return Err(AcquisitionError::PublisherTaken(kind));
        }
        Ok(SourcePublisher {
            slot: Arc::clone(slot),
            filter: LowPassFilter::new(self.filter.enabled),
            time_constant_secs: self.filter.time_constant_secs,
            last_publish: None,
        })
    }

    /// Read the latest published state of `kind`.
    pub fn read(&self, kind: SourceKind) -> Option<SlotReading> {
        self.slots.get(&kind).map(|s| s.read())
    }

    /// Configured sources in snapshot column order.
    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.slots.keys().copied()
    }

    /// Configured channel count of `kind`.
    pub fn channel_count(&self, kind: SourceKind) -> Option<usize> {
        self.slots.get(&kind).map(|s| s.channel_count)
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Single-writer handle to one source's slot.
///
/// Owns the source's [`LowPassFilter`]: every publish runs the raw vector
/// through the filter before it becomes visible to readers.
#[derive(Debug)]
pub struct SourcePublisher {
    slot: Arc<SourceSlot>,
    filter: LowPassFilter,
    time_constant_secs: f64,
    last_publish: Option<Instant>,
}

impl SourcePublisher {
    pub fn kind(&self) -> SourceKind {
        self.slot.kind
    }

    pub fn channel_count(&self) -> usize {
        self.slot.channel_count
    }

    pub fn filter(&self) -> &LowPassFilter {
        &self.filter
    }

    pub fn set_filter_enabled(&mut self, enabled: bool) {
        self.filter.set_enabled(enabled);
    }

    /// Filter `raw` with an explicit sample interval and publish it.
    pub fn publish(&mut self, raw: &[f64], dt_secs: f64) {
        let filtered = self.filter.filter(raw, dt_secs, self.time_constant_secs);
        self.store(filtered);
    }

    /// Filter `raw` using the time since the previous publish as `dt`.
    pub fn publish_now(&mut self, raw: &[f64]) {
        let dt = self
            .last_publish
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        self.publish(raw, dt);
    }

    /// Run every sample of a batch through the filter (each `dt_secs`
    /// apart) and publish only the final filtered vector.
    pub fn publish_batch(&mut self, batch: &[Vec<f64>], dt_secs: f64) {
        let mut last = None;
        for sample in batch {
            last = Some(self.filter.filter(sample, dt_secs, self.time_constant_secs));
        }
        if let Some(filtered) = last {
            self.store(filtered);
        }
    }

    /// Flag the source inactive. The last vector stays in the slot but
    /// readers will report the source invalid.
    pub fn mark_inactive(&mut self) {
        let mut state = self.slot.state.lock();
        if state.vector.active {
            debug!(source = %self.slot.kind, "Source marked inactive");
        }
        state.vector.active = false;
    }

    fn store(&mut self, values: Vec<f64>) {
        let now = Instant::now();
        {
            let mut state = self.slot.state.lock();
            state.vector = RawChannelVector::new(values, true);
            state.updated_at = Some(now);
            state.publishes += 1;
        }
        self.last_publish = Some(now);
    }
}

impl Drop for SourcePublisher {
    fn drop(&mut self) {
        self.mark_inactive();
        self.slot.writer_taken.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SourceRegistry {
        let sources = vec![
            SourceConfig::for_kind(SourceKind::Modbus),
            SourceConfig::for_kind(SourceKind::Daq),
        ];
        SourceRegistry::new(
            &sources,
            FilterConfig {
                enabled: true,
                time_constant_secs: 0.9,
            },
        )
    }

    #[test]
    fn test_unpublished_slot_is_invalid_and_zero_filled() {
        let reg = registry();
        let reading = reg.read(SourceKind::Daq).unwrap();
        assert!(!reading.is_valid(Instant::now(), Duration::from_secs(1)));
        assert_eq!(reading.vector.values, vec![0.0; reg.channel_count(SourceKind::Daq).unwrap()]);
        assert!(reg.read(SourceKind::Serial).is_none());
    }

    #[test]
    fn test_single_writer_per_source() {
        let reg = registry();
        let first = reg.publisher(SourceKind::Modbus).unwrap();
        assert!(matches!(
            reg.publisher(SourceKind::Modbus),
            Err(AcquisitionError::PublisherTaken(SourceKind::Modbus))
        ));
        assert!(matches!(
            reg.publisher(SourceKind::Serial),
            Err(AcquisitionError::NotConfigured(SourceKind::Serial))
        ));
        drop(first);
        assert!(reg.publisher(SourceKind::Modbus).is_ok());
    }

    #[test]
    fn test_publish_filters_before_exposing() {
        let reg = registry();
        let mut publisher = reg.publisher(SourceKind::Modbus).unwrap();
        publisher.publish(&[0.0, 0.0], 0.1);
        publisher.publish(&[10.0, 20.0], 0.1);

        let reading = reg.read(SourceKind::Modbus).unwrap();
        assert!(reading.vector.active);
        assert_eq!(reading.publishes, 2);
        // alpha = 0.1 / (0.9 + 0.1)
        assert!((reading.vector.values[0] - 1.0).abs() < 1e-12);
        assert!((reading.vector.values[1] - 2.0).abs() < 1e-12);
        assert!(reading.is_valid(Instant::now(), Duration::from_secs(1)));
    }

    #[test]
    fn test_stale_reading_is_invalid() {
        let reg = registry();
        let mut publisher = reg.publisher(SourceKind::Daq).unwrap();
        publisher.publish(&[1.0; 8], 0.01);
        let reading = reg.read(SourceKind::Daq).unwrap();
        let later = Instant::now() + Duration::from_millis(1500);
        assert!(!reading.is_valid(later, Duration::from_secs(1)));
    }

    #[test]
    fn test_mark_inactive_and_drop_invalidate() {
        let reg = registry();
        let mut publisher = reg.publisher(SourceKind::Daq).unwrap();
        publisher.publish(&[1.0; 8], 0.01);
        publisher.mark_inactive();
        assert!(!reg.read(SourceKind::Daq).unwrap().vector.active);

        publisher.publish(&[1.0; 8], 0.01);
        drop(publisher);
        assert!(!reg.read(SourceKind::Daq).unwrap().vector.active);
    }

    #[test]
    fn test_publish_batch_runs_every_sample_through_filter() {
        let reg = registry();
        let mut publisher = reg.publisher(SourceKind::Modbus).unwrap();
        publisher.publish_batch(&[vec![0.0, 0.0], vec![10.0, 10.0], vec![10.0, 10.0]], 0.1);
        let v = reg.read(SourceKind::Modbus).unwrap().vector.values;
        // 0 → 1.0 → 1.9
        assert!((v[0] - 1.9).abs() < 1e-12);
        assert_eq!(reg.read(SourceKind::Modbus).unwrap().publishes, 1);
    }

    #[test]
    fn test_concurrent_publish_and_read_never_tear() {
        let reg = Arc::new(registry());
        let mut publisher = reg.publisher(SourceKind::Modbus).unwrap();
        publisher.set_filter_enabled(false);

        let writer = std::thread::spawn(move || {
            for i in 0..2_000 {
                let v = f64::from(i);
                publisher.publish(&[v, v], 0.0);
            }
        });

        for _ in 0..2_000 {
            let values = reg.read(SourceKind::Modbus).unwrap().vector.values;
            assert_eq!(values[0], values[1], "torn read: {values:?}");
        }
        writer.join().unwrap();
    }
}
