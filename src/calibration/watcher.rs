//! Polling-based calibration file watcher.
//!
//! Checks the calibration file's mtime every 2 seconds. When a change is
//! detected, debounces for 500ms (editors and `commit` write in stages),
//! then hot-swaps the store's table and reports the result on an optional
//! mpsc channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::CalibrationStore;
use crate::config::{defaults, CalibrationConfig};

/// Events emitted by the calibration watcher.
#[derive(Debug)]
pub enum CalibrationEvent {
    /// The table was reloaded and now holds this many entries.
    Reloaded { entries: usize },
    /// Reload was attempted but failed (old table remains active).
    Error(String),
}

/// Poll and debounce intervals.
#[derive(Debug, Clone, Copy)]
pub struct WatchTiming {
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl Default for WatchTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::CALIBRATION_POLL_INTERVAL_MS),
            debounce: Duration::from_millis(defaults::CALIBRATION_DEBOUNCE_MS),
        }
    }
}

/// Spawn the watcher for `config.path` if `config.watch` is set.
pub fn spawn_calibration_watcher(
    config: &CalibrationConfig,
    store: Arc<CalibrationStore>,
    cancel: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.watch {
        tracing::debug!("Calibration watcher disabled");
        return None;
    }
    Some(tokio::spawn(run_calibration_watcher(
        config.path.clone(),
        store,
        WatchTiming::default(),
        cancel,
        None,
    )))
}

/// Run the calibration file watcher loop until `cancel` fires or the event
/// channel closes.
pub async fn run_calibration_watcher(
    path: PathBuf,
    store: Arc<CalibrationStore>,
    timing: WatchTiming,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<CalibrationEvent>>,
) {
    tracing::info!(path = %path.display(), "Calibration watcher started");

    let mut last_mtime = get_mtime(&path);

    loop {
        if sleep_or_cancelled(&cancel, timing.poll_interval).await {
            break;
        }

        // File deleted or unreadable: keep the current table and retry.
        let Some(current) = get_mtime(&path) else {
            if last_mtime.is_some() {
                tracing::warn!(
                    path = %path.display(),
                    "Calibration file not accessible, keeping current table, will retry"
                );
                last_mtime = None;
            }
            continue;
        };

        if last_mtime == Some(current) {
            continue;
        }

        // Debounce: wait, then re-check mtime to ensure the write is complete
        if sleep_or_cancelled(&cancel, timing.debounce).await {
            break;
        }
        if get_mtime(&path) != Some(current) {
            continue;
        }

        last_mtime = Some(current);

        let event = match store.reload(&path) {
            Ok(entries) => CalibrationEvent::Reloaded { entries },
            Err(e) => {
                tracing::error!(error = %e, "Calibration hot-reload failed, keeping previous table");
                CalibrationEvent::Error(e.to_string())
            }
        };

        if let Some(tx) = &events {
            if tx.send(event).await.is_err() {
                tracing::debug!("Calibration watcher channel closed, stopping");
                return;
            }
        }
    }

    tracing::debug!("Calibration watcher stopped");
}

async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

/// Read the modification time of a file, returning None on any error.
fn get_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    fn fast() -> WatchTiming {
        WatchTiming {
            poll_interval: Duration::from_millis(20),
            debounce: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_reloads_after_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.ini");
        std::fs::write(&path, "[DAQ]\nChannel_0=0, 0, 1, 0\n").unwrap();

        let store = Arc::new(CalibrationStore::open(&path));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(run_calibration_watcher(
            path.clone(),
            Arc::clone(&store),
            fast(),
            cancel.clone(),
            Some(tx),
        ));
        // Let the watcher record the initial mtime.
        tokio::time::sleep(Duration::from_millis(5)).await;

        std::fs::write(&path, "[DAQ]\nChannel_0=0, 0, 2, 0\nChannel_1=0, 0, 1, 5\n").unwrap();
        bump_mtime(&path, 10);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CalibrationEvent::Reloaded { entries: 2 }));
        assert_eq!(store.apply("DAQ", 0, 3.0), 6.0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_file_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.ini");
        let mut table = CalibrationTable::new();
        table.set("Modbus", 0, crate::types::CalibrationParams::new(0.0, 0.0, 4.0, 0.0));
        table.save(&path).unwrap();

        let store = Arc::new(CalibrationStore::open(&path));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_calibration_watcher(
            path.clone(),
            Arc::clone(&store),
            fast(),
            cancel.clone(),
            None,
        ));

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.apply("Modbus", 0, 1.0), 4.0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_watcher_is_not_spawned() {
        let config = CalibrationConfig {
            watch: false,
            ..CalibrationConfig::default()
        };
        let store = Arc::new(CalibrationStore::default());
        assert!(spawn_calibration_watcher(&config, store, CancellationToken::new()).is_none());
    }
}
