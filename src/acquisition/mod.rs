//! Sensor data acquisition module
//!
//! Each hardware source is driven by an [`IngestionAdapter`] on its own named
//! OS thread. Adapters own the device handle (protocol internals live behind
//! the device traits in [`adapters`]) and the source's [`SourcePublisher`];
//! they publish their latest vector and return to the device immediately,
//! never waiting on the aggregator.

pub mod adapters;
pub mod simulated;

pub use adapters::{
    AnalogCard, FramedLinkAdapter, PolledBusAdapter, RegisterBus, StreamingCardAdapter,
    TelemetryLink,
};

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{SourcePublisher, SourceRegistry};
use crate::types::SourceKind;

/// Acquisition errors
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// Recoverable device fault; the adapter retries on its next cycle.
    #[error("Device error: {0}")]
    Device(String),

    /// The device is gone; the adapter stops.
    #[error("Device disconnected")]
    Disconnected,

    #[error("Publisher for source {0} is already held by another adapter")]
    PublisherTaken(SourceKind),

    #[error("Source {0} is not configured")]
    NotConfigured(SourceKind),

    #[error("Failed to spawn adapter thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A source of channel vectors for one [`SourceKind`].
///
/// `run` blocks on the device until `cancel` fires or the device
/// disconnects. The publisher is dropped on return, which marks the source
/// inactive.
pub trait IngestionAdapter: Send + 'static {
    fn kind(&self) -> SourceKind;

    /// Human-readable name for logging (e.g. "bus-poll", "card-stream").
    fn source_name(&self) -> &str;

    fn run(
        self: Box<Self>,
        publisher: SourcePublisher,
        cancel: CancellationToken,
    ) -> Result<(), AcquisitionError>;
}

/// Take the adapter's publisher from `registry` and run it on a dedicated
/// thread named after its source.
pub fn spawn_adapter(
    adapter: Box<dyn IngestionAdapter>,
    registry: &SourceRegistry,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<(), AcquisitionError>>, AcquisitionError> {
    let kind = adapter.kind();
    let publisher = registry.publisher(kind)?;
    let name = adapter.source_name().to_string();

    let handle = std::thread::Builder::new()
        .name(format!("ingest-{kind}"))
        .spawn(move || {
            info!(source = %kind, adapter = %name, "Ingestion adapter started");
            let result = adapter.run(publisher, cancel);
            match &result {
                Ok(()) => info!(source = %kind, adapter = %name, "Ingestion adapter stopped"),
                Err(e) => warn!(source = %kind, adapter = %name, error = %e, "Ingestion adapter exited"),
            }
            result
        })
        .map_err(AcquisitionError::Spawn)?;

    Ok(handle)
}

/// Sleep for `duration` in short slices, returning `true` as soon as
/// `cancel` fires.
pub fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

/// Consecutive device-fault tracker: one warning per streak, one info line
/// on recovery.
#[derive(Debug, Default)]
pub(crate) struct FaultStreak {
    failures: u64,
}

impl FaultStreak {
    pub(crate) fn record_failure(&mut self, kind: SourceKind, error: &AcquisitionError) {
        self.failures += 1;
        if self.failures == 1 {
            warn!(source = %kind, error = %error, "Device read failed, source marked invalid");
        } else {
            debug!(source = %kind, error = %error, failures = self.failures, "Device still failing");
        }
    }

    pub(crate) fn record_success(&mut self, kind: SourceKind) {
        if self.failures > 0 {
            info!(source = %kind, failed_reads = self.failures, "Device recovered");
            self.failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_or_cancel_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(sleep_or_cancel(&cancel, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_or_cancel_completes() {
        let cancel = CancellationToken::new();
        assert!(!sleep_or_cancel(&cancel, Duration::from_millis(15)));
    }

    #[test]
    fn test_fault_streak_resets_on_success() {
        let mut streak = FaultStreak::default();
        let err = AcquisitionError::Device("timeout".to_string());
        streak.record_failure(SourceKind::Serial, &err);
        streak.record_failure(SourceKind::Serial, &err);
        assert_eq!(streak.failures, 2);
        streak.record_success(SourceKind::Serial);
        assert_eq!(streak.failures, 0);
    }
}
