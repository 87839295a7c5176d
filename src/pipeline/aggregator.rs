//! Snapshot Aggregator
//!
//! Samples every source slot on a fixed cadence, stamps the result with a
//! logical timestamp, applies calibration, and fans the record out.
//!
//! ```text
//!   Idle ──enable()──▶ Running ──disable()──▶ Idle
//! ```
//!
//! Each tick:
//! 1. read the latest validity flag + vector of every source (no waiting)
//! 2. timestamp = tick_count × 0.1 s (logical, jitter-free)
//! 3. computed channels from valid sources only, else 0
//! 4. emit raw + calibrated records (one calibration table view per tick)
//! 5. append calibrated record to history, advance sequence index
//!
//! A computed channel whose input vector is too short evaluates to 0 for
//! that tick; every source still reports normally. The tick counter only
//! advances when a snapshot is emitted, so a panicking tick (caught and
//! logged by the loop) leaves no gap in timestamps or sequence indices.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::slots::SourceRegistry;
use super::snapshot::{DataSnapshot, SourceSnapshot};
use super::{ComputedChannelError, PipelineError};
use crate::calibration::{CalibrationStore, CalibrationTable};
use crate::config::{defaults, PipelineConfig};
use crate::distribution::SnapshotHub;
use crate::types::{ComputedChannel, SourceKind};

/// Aggregator run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// No tick source started
    Idle,
    /// Ticking at the configured interval
    Running,
}

/// Tick counter and transition state, guarded together so concurrent
/// ticks serialise.
#[derive(Debug, Default)]
struct TickClock {
    /// Set by `enable`, or on the first manual tick
    source_started: bool,
    /// Snapshots emitted; the next sequence index and logical time step
    tick_count: u64,
    /// Validity seen on the previous tick, for transition logging
    last_validity: BTreeMap<SourceKind, bool>,
    /// Computed channels (by index) that fell back to 0 on the previous tick
    degraded_computed: BTreeSet<usize>,
}

#[derive(Debug)]
struct AggregatorCore {
    registry: Arc<SourceRegistry>,
    calibration: Arc<CalibrationStore>,
    hub: SnapshotHub,
    computed: Vec<ComputedChannel>,
    tick_interval: Duration,
    stale_after: Duration,
    clock: Mutex<TickClock>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Fixed-cadence snapshot assembler.
pub struct Aggregator {
    core: Arc<AggregatorCore>,
    run: Mutex<Option<RunHandle>>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("state", &self.state())
            .field("tick_interval", &self.core.tick_interval)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<SourceRegistry>,
        calibration: Arc<CalibrationStore>,
        hub: SnapshotHub,
    ) -> Self {
        Self {
            core: Arc::new(AggregatorCore {
                registry,
                calibration,
                hub,
                computed: config.computed.clone(),
                tick_interval: config.aggregator.tick_interval(),
                stale_after: config.aggregator.stale_after(),
                clock: Mutex::new(TickClock::default()),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AggregatorState {
        match &*self.run.lock() {
            Some(handle) if !handle.task.is_finished() => AggregatorState::Running,
            _ => AggregatorState::Idle,
        }
    }

    pub fn hub(&self) -> &SnapshotHub {
        &self.core.hub
    }

    /// Most recently emitted calibrated snapshot.
    pub fn latest(&self) -> Option<Arc<DataSnapshot>> {
        self.core.hub.latest()
    }

    /// Idle → Running. Starts the monotonic tick source and spawns the tick
    /// loop on the current tokio runtime. Enabling twice is a no-op.
    pub fn enable(&self) -> Result<(), PipelineError> {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|h| !h.task.is_finished()) {
            debug!("Aggregator already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        self.core.clock.lock().source_started = true;

        let cancel = CancellationToken::new();
        let core = Arc::clone(&self.core);
        let task = runtime.spawn(run_tick_loop(core, cancel.clone()));
        *run = Some(RunHandle { cancel, task });

        info!(
            interval_ms = self.core.tick_interval.as_millis() as u64,
            sources = self.core.registry.kinds().count(),
            "Aggregator enabled"
        );
        Ok(())
    }

    /// Running → Idle. No further ticks fire once this returns; a tick that
    /// is already executing completes normally.
    pub async fn disable(&self) {
        let handle = self.run.lock().take();
        if let Some(RunHandle { cancel, task }) = handle {
            cancel.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "Aggregator task ended abnormally");
            }
            info!("Aggregator disabled");
        }
    }

    /// Assemble and emit one snapshot now. Used by the tick loop; callable
    /// directly for deterministic stepping.
    pub fn tick(&self) -> Arc<DataSnapshot> {
        self.core.tick()
    }
}

async fn run_tick_loop(core: Arc<AggregatorCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match std::panic::catch_unwind(AssertUnwindSafe(|| core.tick())) {
            Ok(snapshot) => {
                trace!(seq = snapshot.sequence_index, t = snapshot.timestamp, "Tick emitted");
            }
            Err(_) => {
                error!("Tick panicked, continuing with next tick");
            }
        }
    }

    debug!("Aggregator tick loop stopped");
}

impl AggregatorCore {
    fn tick(&self) -> Arc<DataSnapshot> {
        let mut clock = self.clock.lock();

        if !clock.source_started {
            warn!("Tick source was not started, self-initialising");
            clock.source_started = true;
        }

        let now = Instant::now();
        let wall_clock = Utc::now();
        let table = self.calibration.table();

        let mut raw_sources = BTreeMap::new();
        let mut cal_sources = BTreeMap::new();

        for kind in self.registry.kinds() {
            let channels = self.registry.channel_count(kind).unwrap_or(0);
            let valid = self
                .registry
                .read(kind)
                .filter(|r| r.is_valid(now, self.stale_after));

            let previously_valid = clock.last_validity.insert(kind, valid.is_some());
            match (previously_valid, valid.is_some()) {
                (Some(true), false) => warn!(source = %kind, "Source became invalid (stale or inactive)"),
                (Some(false) | None, true) => info!(source = %kind, "Source valid"),
                _ => {}
            }

            match valid {
                Some(reading) => {
                    let raw = reading.vector.values;
                    let calibrated = calibrate(&table, kind, &raw);
                    raw_sources.insert(kind, SourceSnapshot { valid: true, channels: raw });
                    cal_sources.insert(kind, SourceSnapshot { valid: true, channels: calibrated });
                }
                None => {
                    raw_sources.insert(kind, SourceSnapshot::invalid(channels));
                    cal_sources.insert(kind, SourceSnapshot::invalid(channels));
                }
            }
        }

        // Calibration preserves vector lengths, so both passes fail alike.
        let mut faults = BTreeMap::new();
        let raw_computed = compute_channels(&self.computed, &raw_sources, &mut faults);
        let cal_computed = compute_channels(&self.computed, &cal_sources, &mut BTreeMap::new());
        report_computed_faults(&self.computed, &mut clock.degraded_computed, faults);

        let sequence_index = clock.tick_count;
        clock.tick_count += 1;
        let timestamp = sequence_index as f64 * defaults::LOGICAL_TICK_SECS;

        let raw = Arc::new(DataSnapshot {
            timestamp,
            sequence_index,
            wall_clock,
            calibrated: false,
            sources: raw_sources,
            computed: raw_computed,
        });
        let calibrated = Arc::new(DataSnapshot {
            timestamp,
            sequence_index,
            wall_clock,
            calibrated: true,
            sources: cal_sources,
            computed: cal_computed,
        });

        // Publish while still holding the clock so consumers observe
        // sequence indices in order even if ticks race.
        self.hub.publish(raw, Arc::clone(&calibrated));
        drop(clock);

        calibrated
    }
}

fn calibrate(table: &CalibrationTable, kind: SourceKind, raw: &[f64]) -> Vec<f64> {
    let section = kind.section_name();
    raw.iter()
        .enumerate()
        .map(|(channel, &x)| table.apply(section, channel, x))
        .collect()
}

/// Evaluate computed channels; a channel is 0 unless both sources are valid
/// and both referenced channels were published. Channels that could not be
/// evaluated are recorded in `faults` by index.
fn compute_channels(
    computed: &[ComputedChannel],
    sources: &BTreeMap<SourceKind, SourceSnapshot>,
    faults: &mut BTreeMap<usize, ComputedChannelError>,
) -> Vec<f64> {
    computed
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            let lhs = sources.get(&c.lhs.source).filter(|s| s.valid);
            let rhs = sources.get(&c.rhs.source).filter(|s| s.valid);
            let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                return 0.0;
            };
            let inputs = channel_value(c, lhs, c.lhs.source, c.lhs.channel)
                .and_then(|l| channel_value(c, rhs, c.rhs.source, c.rhs.channel).map(|r| (l, r)));
            match inputs {
                Ok((l, r)) => c.op.evaluate(l, r),
                Err(e) => {
                    faults.insert(idx, e);
                    0.0
                }
            }
        })
        .collect()
}

fn channel_value(
    computed: &ComputedChannel,
    source: &SourceSnapshot,
    kind: SourceKind,
    channel: usize,
) -> Result<f64, ComputedChannelError> {
    source
        .channels
        .get(channel)
        .copied()
        .ok_or_else(|| ComputedChannelError::ChannelOutOfRange {
            name: computed.name.clone(),
            kind,
            channel,
            len: source.channels.len(),
        })
}

/// Warn once when a computed channel starts falling back to 0, and log
/// recovery when it evaluates again.
fn report_computed_faults(
    computed: &[ComputedChannel],
    degraded: &mut BTreeSet<usize>,
    faults: BTreeMap<usize, ComputedChannelError>,
) {
    for (idx, error) in &faults {
        if degraded.insert(*idx) {
            warn!(error = %error, "Computed channel unavailable, reporting 0");
        }
    }
    degraded.retain(|idx| {
        let still_failing = faults.contains_key(idx);
        if !still_failing {
            if let Some(c) = computed.get(*idx) {
                info!(computed = %c.name, "Computed channel recovered");
            }
        }
        still_failing
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use crate::types::{CalibrationParams, ChannelRef, ComputedOp};

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.filter.enabled = false;
        config.computed.push(ComputedChannel {
            name: "power".to_string(),
            op: ComputedOp::Product,
            lhs: ChannelRef::new(SourceKind::Modbus, 0),
            rhs: ChannelRef::new(SourceKind::Daq, 1),
        });
        config
    }

    fn build(config: &PipelineConfig, table: CalibrationTable) -> (Aggregator, Arc<SourceRegistry>) {
        let registry = Arc::new(SourceRegistry::from_config(config));
        let hub = SnapshotHub::new(16, config.aggregator.history_capacity);
        let store = Arc::new(CalibrationStore::new(table));
        (Aggregator::new(config, Arc::clone(&registry), store, hub), registry)
    }

    #[test]
    fn test_sequence_and_timestamps_are_gap_free() {
        let config = config();
        let (agg, _registry) = build(&config, CalibrationTable::new());

        let snaps: Vec<_> = (0..25).map(|_| agg.tick()).collect();
        for (k, pair) in snaps.windows(2).enumerate() {
            assert_eq!(pair[1].sequence_index, pair[0].sequence_index + 1, "at {k}");
            assert!((pair[1].timestamp - pair[0].timestamp - 0.1).abs() < 1e-9);
        }
        assert_eq!(snaps[0].sequence_index, 0);
        assert_eq!(snaps[0].timestamp, 0.0);
    }

    #[test]
    fn test_invalid_source_zero_filled_and_excluded_from_computed() {
        let config = config();
        let (agg, registry) = build(&config, CalibrationTable::new());
        let mut modbus = registry.publisher(SourceKind::Modbus).unwrap();
        modbus.publish(&[3.0, 1.0, 1.0, 1.0], 0.1);

        let snap = agg.tick();
        assert!(snap.is_valid(SourceKind::Modbus));
        assert!(!snap.is_valid(SourceKind::Daq));
        assert_eq!(snap.channels(SourceKind::Daq), &[0.0; 8]);
        assert_eq!(snap.computed, vec![0.0]);
    }

    #[test]
    fn test_computed_channel_uses_calibrated_values() {
        let config = config();
        let mut table = CalibrationTable::new();
        table.set("DAQ", 1, CalibrationParams::new(0.0, 0.0, 2.0, 0.0));
        // Offset on an invalid-source channel must not leak into zeros.
        table.set("Serial", 0, CalibrationParams::new(0.0, 0.0, 1.0, 5.0));
        let (agg, registry) = build(&config, table);

        let mut modbus = registry.publisher(SourceKind::Modbus).unwrap();
        let mut daq = registry.publisher(SourceKind::Daq).unwrap();
        modbus.publish(&[3.0, 0.0, 0.0, 0.0], 0.1);
        daq.publish(&[0.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.1);

        let calibrated = agg.tick();
        assert_eq!(calibrated.channels(SourceKind::Daq)[1], 8.0);
        assert_eq!(calibrated.computed, vec![24.0]);
        assert_eq!(calibrated.channels(SourceKind::Serial), &[0.0; 3]);

        let retained = agg.hub().history().latest().unwrap();
        assert!(retained.calibrated);
        assert_eq!(retained.sequence_index, calibrated.sequence_index);
    }

    #[tokio::test]
    async fn test_raw_and_calibrated_share_sequence() {
        let config = config();
        let mut table = CalibrationTable::new();
        table.set("Modbus", 0, CalibrationParams::new(0.0, 0.0, 10.0, 0.0));
        let (agg, registry) = build(&config, table);
        let mut raw_rx = agg.hub().subscribe_raw();
        let mut cal_rx = agg.hub().subscribe();

        let mut modbus = registry.publisher(SourceKind::Modbus).unwrap();
        modbus.publish(&[1.5, 0.0, 0.0, 0.0], 0.1);
        agg.tick();

        let raw = raw_rx.recv().await.unwrap();
        let cal = cal_rx.recv().await.unwrap();
        assert_eq!(raw.sequence_index, cal.sequence_index);
        assert_eq!(raw.timestamp, cal.timestamp);
        assert_eq!(raw.channels(SourceKind::Modbus)[0], 1.5);
        assert_eq!(cal.channels(SourceKind::Modbus)[0], 15.0);
    }

    #[test]
    fn test_short_vector_zeroes_only_affected_computed_channel() {
        let mut config = config();
        config.computed[0].lhs.channel = 2;
        let (agg, registry) = build(&config, CalibrationTable::new());
        let mut modbus = registry.publisher(SourceKind::Modbus).unwrap();
        let mut daq = registry.publisher(SourceKind::Daq).unwrap();
        // Publisher shrank the vector below the configured channel count.
        modbus.publish(&[1.0, 2.0], 0.1);
        daq.publish(&[1.0; 8], 0.1);

        let snap = agg.tick();
        assert_eq!(snap.sequence_index, 0);
        assert!(snap.is_valid(SourceKind::Modbus));
        assert_eq!(snap.channels(SourceKind::Modbus), &[1.0, 2.0]);
        assert_eq!(snap.channels(SourceKind::Daq), &[1.0; 8]);
        assert_eq!(snap.computed, vec![0.0]);
        assert!(agg.core.clock.lock().degraded_computed.contains(&0));

        modbus.publish(&[1.0, 2.0, 3.0, 4.0], 0.1);
        let snap = agg.tick();
        assert_eq!(snap.sequence_index, 1);
        assert!((snap.timestamp - 0.1).abs() < 1e-12);
        assert_eq!(snap.computed, vec![3.0]);
        assert!(agg.core.clock.lock().degraded_computed.is_empty());
    }

    #[test]
    fn test_short_publish_between_good_ticks_keeps_spacing() {
        let mut config = config();
        config.computed[0].lhs.channel = 3;
        let (agg, registry) = build(&config, CalibrationTable::new());
        let mut modbus = registry.publisher(SourceKind::Modbus).unwrap();
        let mut daq = registry.publisher(SourceKind::Daq).unwrap();
        daq.publish(&[2.0; 8], 0.1);

        modbus.publish(&[1.0, 1.0, 1.0, 1.0], 0.1);
        let first = agg.tick();
        modbus.publish(&[1.0, 1.0], 0.1);
        let second = agg.tick();
        modbus.publish(&[1.0, 1.0, 1.0, 1.0], 0.1);
        let third = agg.tick();

        let snaps = [first, second, third];
        for pair in snaps.windows(2) {
            assert_eq!(pair[1].sequence_index, pair[0].sequence_index + 1);
            assert!(
                (pair[1].timestamp - pair[0].timestamp - 0.1).abs() < 1e-9,
                "spaced {}",
                pair[1].timestamp - pair[0].timestamp
            );
        }
        let computed: Vec<f64> = snaps.iter().map(|s| s.computed[0]).collect();
        assert_eq!(computed, vec![2.0, 0.0, 2.0]);
    }

    #[test]
    fn test_manual_tick_self_initialises_tick_source() {
        let (agg, _registry) = build(&config(), CalibrationTable::new());
        assert!(!agg.core.clock.lock().source_started);
        agg.tick();
        assert!(agg.core.clock.lock().source_started);
    }

    #[test]
    fn test_reload_takes_effect_on_next_tick() {
        let config = config();
        let (agg, registry) = build(&config, CalibrationTable::new());
        let mut daq = registry.publisher(SourceKind::Daq).unwrap();
        daq.publish(&[1.0; 8], 0.1);

        let before = agg.tick();
        assert!(before.channels(SourceKind::Daq).iter().all(|&v| v == 1.0));

        let mut table = CalibrationTable::new();
        for ch in 0..8 {
            table.set("DAQ", ch, CalibrationParams::new(0.0, 0.0, 3.0, 0.0));
        }
        agg.core.calibration.replace(table);

        let after = agg.tick();
        assert!(after.channels(SourceKind::Daq).iter().all(|&v| v == 3.0));
    }

    #[tokio::test]
    async fn test_enable_disable_state_machine() {
        let mut config = config();
        config.aggregator.tick_interval_ms = 5;
        let (agg, _registry) = build(&config, CalibrationTable::new());
        assert_eq!(agg.state(), AggregatorState::Idle);

        agg.enable().unwrap();
        agg.enable().unwrap();
        assert_eq!(agg.state(), AggregatorState::Running);

        tokio::time::sleep(Duration::from_millis(60)).await;
        agg.disable().await;
        assert_eq!(agg.state(), AggregatorState::Idle);

        let last = agg.latest().unwrap();
        let history = agg.hub().history().to_vec();
        assert!(history.len() >= 2);
        for pair in history.windows(2) {
            assert_eq!(pair[1].sequence_index, pair[0].sequence_index + 1);
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agg.latest().unwrap().sequence_index, last.sequence_index);
    }

    #[test]
    fn test_enable_without_runtime_fails() {
        let (agg, _registry) = build(&config(), CalibrationTable::new());
        assert!(matches!(agg.enable(), Err(PipelineError::NoRuntime)));
        assert_eq!(agg.state(), AggregatorState::Idle);
    }
}
