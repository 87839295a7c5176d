//! The three ingestion adapter kinds and the device traits they drive.
//!
//! | Adapter                  | Device            | Cadence                        |
//! |--------------------------|-------------------|--------------------------------|
//! | [`PolledBusAdapter`]     | [`RegisterBus`]   | scan on a fixed interval       |
//! | [`StreamingCardAdapter`] | [`AnalogCard`]    | continuous sample batches      |
//! | [`FramedLinkAdapter`]    | [`TelemetryLink`] | whenever a frame decodes       |

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{sleep_or_cancel, AcquisitionError, FaultStreak, IngestionAdapter};
use crate::pipeline::SourcePublisher;
use crate::types::SourceKind;

/// Polled register bus: one scan returns one value per configured register.
pub trait RegisterBus: Send + 'static {
    fn scan(&mut self) -> Result<Vec<f64>, AcquisitionError>;
}

/// Continuously sampling analog card.
pub trait AnalogCard: Send + 'static {
    fn sample_rate_hz(&self) -> f64;

    /// Block up to `timeout` for the next batch; each inner vector is one
    /// multi-channel sample. An empty batch means nothing arrived in time.
    fn read_batch(&mut self, timeout: Duration) -> Result<Vec<Vec<f64>>, AcquisitionError>;
}

/// Framed serial telemetry link.
pub trait TelemetryLink: Send + 'static {
    /// Block up to `timeout` for the next decoded frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f64>>, AcquisitionError>;
}

/// Device-read timeout for push-style adapters, so cancellation is observed
/// promptly even when the device is silent.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Shared error policy: `Disconnected` ends the adapter, anything else marks
/// the source inactive until the next successful read.
fn handle_fault(
    error: AcquisitionError,
    publisher: &mut SourcePublisher,
    streak: &mut FaultStreak,
) -> Result<(), AcquisitionError> {
    publisher.mark_inactive();
    match error {
        AcquisitionError::Disconnected => Err(AcquisitionError::Disconnected),
        other => {
            streak.record_failure(publisher.kind(), &other);
            Ok(())
        }
    }
}

// ============================================================================
// Polled bus
// ============================================================================

pub struct PolledBusAdapter<D: RegisterBus> {
    kind: SourceKind,
    device: D,
    interval: Duration,
}

impl<D: RegisterBus> PolledBusAdapter<D> {
    pub fn new(kind: SourceKind, device: D, interval: Duration) -> Self {
        Self {
            kind,
            device,
            interval,
        }
    }
}

impl<D: RegisterBus> IngestionAdapter for PolledBusAdapter<D> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn source_name(&self) -> &str {
        "bus-poll"
    }

    fn run(
        mut self: Box<Self>,
        mut publisher: SourcePublisher,
        cancel: CancellationToken,
    ) -> Result<(), AcquisitionError> {
        let mut streak = FaultStreak::default();
        while !cancel.is_cancelled() {
            match self.device.scan() {
                Ok(values) => {
                    streak.record_success(self.kind);
                    publisher.publish_now(&values);
                }
                Err(e) => handle_fault(e, &mut publisher, &mut streak)?,
            }
            if sleep_or_cancel(&cancel, self.interval) {
                break;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Streaming card
// ============================================================================

pub struct StreamingCardAdapter<D: AnalogCard> {
    kind: SourceKind,
    device: D,
}

impl<D: AnalogCard> StreamingCardAdapter<D> {
    pub fn new(kind: SourceKind, device: D) -> Self {
        Self { kind, device }
    }
}

impl<D: AnalogCard> IngestionAdapter for StreamingCardAdapter<D> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn source_name(&self) -> &str {
        "card-stream"
    }

    fn run(
        mut self: Box<Self>,
        mut publisher: SourcePublisher,
        cancel: CancellationToken,
    ) -> Result<(), AcquisitionError> {
        let rate = self.device.sample_rate_hz();
        if !(rate.is_finite() && rate > 0.0) {
            warn!(source = %self.kind, rate, "Invalid card sample rate");
            return Err(AcquisitionError::Device(format!("invalid sample rate {rate}")));
        }
        let dt = 1.0 / rate;
        debug!(source = %self.kind, rate, "Streaming card sample interval {:.6}s", dt);

        let mut streak = FaultStreak::default();
        while !cancel.is_cancelled() {
            match self.device.read_batch(READ_TIMEOUT) {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    streak.record_success(self.kind);
                    publisher.publish_batch(&batch, dt);
                }
                Err(e) => {
                    handle_fault(e, &mut publisher, &mut streak)?;
                    if sleep_or_cancel(&cancel, READ_TIMEOUT) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Framed link
// ============================================================================

pub struct FramedLinkAdapter<D: TelemetryLink> {
    kind: SourceKind,
    device: D,
}

impl<D: TelemetryLink> FramedLinkAdapter<D> {
    pub fn new(kind: SourceKind, device: D) -> Self {
        Self { kind, device }
    }
}

impl<D: TelemetryLink> IngestionAdapter for FramedLinkAdapter<D> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn source_name(&self) -> &str {
        "link-frames"
    }

    fn run(
        mut self: Box<Self>,
        mut publisher: SourcePublisher,
        cancel: CancellationToken,
    ) -> Result<(), AcquisitionError> {
        let mut streak = FaultStreak::default();
        while !cancel.is_cancelled() {
            match self.device.next_frame(READ_TIMEOUT) {
                Ok(Some(frame)) => {
                    streak.record_success(self.kind);
                    publisher.publish_now(&frame);
                }
                // No frame yet: staleness is the aggregator's call.
                Ok(None) => {}
                Err(e) => {
                    handle_fault(e, &mut publisher, &mut streak)?;
                    if sleep_or_cancel(&cancel, READ_TIMEOUT) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::spawn_adapter;
    use crate::config::{FilterConfig, SourceConfig};
    use crate::pipeline::SourceRegistry;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Replays scripted results, then reports `Disconnected`.
    struct ScriptedBus(VecDeque<Result<Vec<f64>, AcquisitionError>>);

    impl RegisterBus for ScriptedBus {
        fn scan(&mut self) -> Result<Vec<f64>, AcquisitionError> {
            self.0.pop_front().unwrap_or(Err(AcquisitionError::Disconnected))
        }
    }

    struct ConstantCard;

    impl AnalogCard for ConstantCard {
        fn sample_rate_hz(&self) -> f64 {
            1000.0
        }

        fn read_batch(&mut self, _timeout: Duration) -> Result<Vec<Vec<f64>>, AcquisitionError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(vec![vec![1.0, 2.0]; 5])
        }
    }

    struct SilentLink;

    impl TelemetryLink for SilentLink {
        fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f64>>, AcquisitionError> {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(None)
        }
    }

    fn registry(kind: SourceKind) -> SourceRegistry {
        SourceRegistry::new(
            &[SourceConfig::for_kind(kind)],
            FilterConfig {
                enabled: false,
                time_constant_secs: 0.5,
            },
        )
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_bus_fault_marks_inactive_then_recovers_then_disconnects() {
        let reg = registry(SourceKind::Modbus);
        let script = VecDeque::from(vec![
            Ok(vec![1.0, 2.0, 3.0, 4.0]),
            Err(AcquisitionError::Device("crc".to_string())),
            Ok(vec![5.0, 6.0, 7.0, 8.0]),
        ]);
        let adapter = PolledBusAdapter::new(SourceKind::Modbus, ScriptedBus(script), Duration::ZERO);
        let handle = spawn_adapter(Box::new(adapter), &reg, CancellationToken::new()).unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(AcquisitionError::Disconnected)));

        let reading = reg.read(SourceKind::Modbus).unwrap();
        assert_eq!(reading.vector.values, vec![5.0, 6.0, 7.0, 8.0]);
        assert!(!reading.vector.active);
        assert_eq!(reading.publishes, 2);
        // Writer role released on exit.
        assert!(reg.publisher(SourceKind::Modbus).is_ok());
    }

    #[test]
    fn test_card_publishes_batches_until_cancelled() {
        let reg = registry(SourceKind::Daq);
        let cancel = CancellationToken::new();
        let adapter = StreamingCardAdapter::new(SourceKind::Daq, ConstantCard);
        let handle = spawn_adapter(Box::new(adapter), &reg, cancel.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            reg.read(SourceKind::Daq).unwrap().publishes >= 3
        }));
        assert!(reg.read(SourceKind::Daq).unwrap().vector.active);

        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
        assert!(!reg.read(SourceKind::Daq).unwrap().vector.active);
    }

    #[test]
    fn test_silent_link_never_publishes() {
        let reg = registry(SourceKind::Serial);
        let cancel = CancellationToken::new();
        let handle = spawn_adapter(
            Box::new(FramedLinkAdapter::new(SourceKind::Serial, SilentLink)),
            &reg,
            cancel.clone(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(reg.read(SourceKind::Serial).unwrap().publishes, 0);
    }

    #[test]
    fn test_second_adapter_for_same_source_is_rejected() {
        let reg = registry(SourceKind::Serial);
        let cancel = CancellationToken::new();
        let first = spawn_adapter(
            Box::new(FramedLinkAdapter::new(SourceKind::Serial, SilentLink)),
            &reg,
            cancel.clone(),
        )
        .unwrap();
        let second = spawn_adapter(
            Box::new(FramedLinkAdapter::new(SourceKind::Serial, SilentLink)),
            &reg,
            cancel.clone(),
        );
        assert!(matches!(second, Err(AcquisitionError::PublisherTaken(SourceKind::Serial))));
        cancel.cancel();
        first.join().unwrap().unwrap();
    }
}
