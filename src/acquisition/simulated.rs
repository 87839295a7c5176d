//! Simulated devices for `--simulate` mode and tests.
//!
//! Each device produces slow sinusoidal drift around a per-channel baseline
//! with Gaussian noise. The telemetry link spaces frames with exponentially
//! distributed gaps, so it goes quiet now and then the way a real serial
//! link does. Seeding makes runs reproducible.

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand_distr::{Distribution, Exp, Normal};

use super::adapters::{AnalogCard, RegisterBus, TelemetryLink};
use super::{AcquisitionError, FramedLinkAdapter, IngestionAdapter, PolledBusAdapter, StreamingCardAdapter};
use crate::config::{defaults, PipelineConfig};
use crate::types::SourceKind;

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn noise(std_dev: f64) -> Result<Normal<f64>, AcquisitionError> {
    Normal::new(0.0, std_dev).map_err(|e| AcquisitionError::Device(format!("noise model: {e}")))
}

/// Baseline for channel `ch`: distinct per channel so plots separate.
fn baseline(ch: usize, scale: f64) -> f64 {
    (ch as f64 + 1.0) * scale
}

// ============================================================================
// Register bus
// ============================================================================

pub struct SimulatedBus {
    rng: StdRng,
    noise: Normal<f64>,
    channels: usize,
    started: Instant,
    /// Probability in [0, 1] that a scan times out
    fault_rate: f64,
}

impl SimulatedBus {
    pub fn new(channels: usize, seed: Option<u64>) -> Result<Self, AcquisitionError> {
        Ok(Self {
            rng: seeded(seed),
            noise: noise(0.05)?,
            channels,
            started: Instant::now(),
            fault_rate: 0.0,
        })
    }

    #[must_use]
    pub fn with_fault_rate(mut self, fault_rate: f64) -> Self {
        self.fault_rate = fault_rate.clamp(0.0, 1.0);
        self
    }
}

impl RegisterBus for SimulatedBus {
    fn scan(&mut self) -> Result<Vec<f64>, AcquisitionError> {
        if self.fault_rate > 0.0 && self.rng.gen_bool(self.fault_rate) {
            return Err(AcquisitionError::Device("register read timed out".to_string()));
        }
        let t = self.started.elapsed().as_secs_f64();
        Ok((0..self.channels)
            .map(|ch| {
                let drift = 0.5 * (TAU * t / 30.0 + ch as f64).sin();
                baseline(ch, 10.0) + drift + self.noise.sample(&mut self.rng)
            })
            .collect())
    }
}

// ============================================================================
// Analog card
// ============================================================================

pub struct SimulatedCard {
    rng: StdRng,
    noise: Normal<f64>,
    channels: usize,
    rate_hz: f64,
    batch_interval: Duration,
    samples_emitted: u64,
}

impl SimulatedCard {
    pub fn new(
        channels: usize,
        rate_hz: f64,
        batch_interval: Duration,
        seed: Option<u64>,
    ) -> Result<Self, AcquisitionError> {
        Ok(Self {
            rng: seeded(seed),
            noise: noise(0.002)?,
            channels,
            rate_hz,
            batch_interval,
            samples_emitted: 0,
        })
    }
}

impl AnalogCard for SimulatedCard {
    fn sample_rate_hz(&self) -> f64 {
        self.rate_hz
    }

    fn read_batch(&mut self, timeout: Duration) -> Result<Vec<Vec<f64>>, AcquisitionError> {
        let wait = self.batch_interval.min(timeout);
        std::thread::sleep(wait);

        let count = (wait.as_secs_f64() * self.rate_hz).round().max(1.0) as usize;
        let batch = (0..count)
            .map(|i| {
                let t = (self.samples_emitted + i as u64) as f64 / self.rate_hz;
                (0..self.channels)
                    .map(|ch| {
                        let hum = 0.01 * (TAU * 50.0 * t).sin();
                        baseline(ch, 0.5) + hum + self.noise.sample(&mut self.rng)
                    })
                    .collect()
            })
            .collect();
        self.samples_emitted += count as u64;
        Ok(batch)
    }
}

// ============================================================================
// Telemetry link
// ============================================================================

pub struct SimulatedLink {
    rng: StdRng,
    noise: Normal<f64>,
    gap: Exp<f64>,
    channels: usize,
}

impl SimulatedLink {
    /// `mean_gap` is the average time between frames.
    pub fn new(channels: usize, mean_gap: Duration, seed: Option<u64>) -> Result<Self, AcquisitionError> {
        let mean_secs = mean_gap.as_secs_f64().max(1e-3);
        Ok(Self {
            rng: seeded(seed),
            noise: noise(0.5)?,
            gap: Exp::new(1.0 / mean_secs)
                .map_err(|e| AcquisitionError::Device(format!("frame gap model: {e}")))?,
            channels,
        })
    }
}

impl TelemetryLink for SimulatedLink {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f64>>, AcquisitionError> {
        let gap = Duration::from_secs_f64(self.gap.sample(&mut self.rng));
        if gap > timeout {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        std::thread::sleep(gap);
        Ok(Some(
            (0..self.channels)
                .map(|ch| baseline(ch, 25.0) + self.noise.sample(&mut self.rng))
                .collect(),
        ))
    }
}

/// One simulated adapter per configured source.
pub fn simulated_adapters(
    config: &PipelineConfig,
    seed: Option<u64>,
) -> Result<Vec<Box<dyn IngestionAdapter>>, AcquisitionError> {
    let mut adapters: Vec<Box<dyn IngestionAdapter>> = Vec::with_capacity(config.sources.len());
    for (i, source) in config.sources.iter().enumerate() {
        let seed = seed.map(|s| s.wrapping_add(i as u64));
        let adapter: Box<dyn IngestionAdapter> = match source.kind {
            SourceKind::Modbus => Box::new(PolledBusAdapter::new(
                source.kind,
                SimulatedBus::new(source.channel_count, seed)?,
                source.interval(),
            )),
            SourceKind::Daq => Box::new(StreamingCardAdapter::new(
                source.kind,
                SimulatedCard::new(
                    source.channel_count,
                    defaults::SIMULATED_DAQ_RATE_HZ,
                    source.interval(),
                    seed,
                )?,
            )),
            SourceKind::Serial => Box::new(FramedLinkAdapter::new(
                source.kind,
                SimulatedLink::new(source.channel_count, source.interval(), seed)?,
            )),
        };
        adapters.push(adapter);
    }
    Ok(adapters)
}
