//! UDP JSON broadcaster: one datagram per calibrated snapshot.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DistributionError, SnapshotSubscription};
use crate::pipeline::DataSnapshot;

/// Wire form of a snapshot for network consumers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage<'a> {
    pub timestamp: f64,
    pub sequence_index: u64,
    pub wall_clock: DateTime<Utc>,
    pub per_source_validity: BTreeMap<&'static str, bool>,
    pub per_source_channels: BTreeMap<&'static str, &'a [f64]>,
    pub computed_channels: &'a [f64],
}

impl<'a> From<&'a DataSnapshot> for SnapshotMessage<'a> {
    fn from(s: &'a DataSnapshot) -> Self {
        Self {
            timestamp: s.timestamp,
            sequence_index: s.sequence_index,
            wall_clock: s.wall_clock,
            per_source_validity: s.per_source_validity(),
            per_source_channels: s.per_source_channels(),
            computed_channels: &s.computed,
        }
    }
}

pub struct UdpBroadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    sent: u64,
}

impl UdpBroadcaster {
    /// Bind an ephemeral local port with broadcast enabled.
    pub async fn bind(target: SocketAddr) -> Result<Self, DistributionError> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0_u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        info!(%target, local = ?socket.local_addr().ok(), "UDP broadcaster bound");
        Ok(Self {
            socket,
            target,
            sent: 0,
        })
    }

    pub async fn send(&mut self, snapshot: &DataSnapshot) -> Result<usize, DistributionError> {
        let payload = serde_json::to_vec(&SnapshotMessage::from(snapshot))?;
        let n = self.socket.send_to(&payload, self.target).await?;
        self.sent += 1;
        Ok(n)
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// Broadcast calibrated snapshots from `rx` until `cancel` fires or the hub
/// closes. Send failures are logged and skipped.
pub async fn run_broadcaster(
    mut broadcaster: UdpBroadcaster,
    mut rx: SnapshotSubscription,
    cancel: CancellationToken,
) -> u64 {
    let mut failures = 0_u64;
    loop {
        let snapshot = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(s) => s,
                None => break,
            },
        };
        match broadcaster.send(&snapshot).await {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!(error = %e, seq = snapshot.sequence_index, "Snapshot broadcast failed");
                }
            }
        }
    }
    debug!(sent = broadcaster.sent(), "UDP broadcaster stopped");
    broadcaster.sent()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SourceSnapshot;
    use crate::types::SourceKind;

    fn snapshot() -> DataSnapshot {
        let mut sources = BTreeMap::new();
        sources.insert(
            SourceKind::Serial,
            SourceSnapshot {
                valid: true,
                channels: vec![25.5, 50.25],
            },
        );
        sources.insert(SourceKind::Modbus, SourceSnapshot::invalid(2));
        DataSnapshot {
            timestamp: 4.2,
            sequence_index: 42,
            wall_clock: Utc::now(),
            calibrated: true,
            sources,
            computed: vec![1.5],
        }
    }

    #[test]
    fn test_message_shape() {
        let snap = snapshot();
        let json = serde_json::to_value(SnapshotMessage::from(&snap)).unwrap();
        assert_eq!(json["sequenceIndex"], 42);
        assert_eq!(json["perSourceValidity"]["Serial"], true);
        assert_eq!(json["perSourceValidity"]["Modbus"], false);
        assert_eq!(json["perSourceChannels"]["Modbus"], serde_json::json!([0.0, 0.0]));
        assert_eq!(json["computedChannels"], serde_json::json!([1.5]));
    }

    #[tokio::test]
    async fn test_datagram_round_trip_on_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut broadcaster = UdpBroadcaster::bind(target).await.unwrap();

        broadcaster.send(&snapshot()).await.unwrap();

        let mut buf = vec![0_u8; 8192];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(json["timestamp"], 4.2);
        assert_eq!(broadcaster.sent(), 1);
    }
}
