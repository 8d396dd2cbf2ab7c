//! UDP echo server
//!
//! Echoes every datagram back to its sender and periodically exports the
//! number of packets and bytes served.

use super::{Server, ServerType};
use crate::config::ServerDef;
use crate::{CadenceError, Result};
use async_trait::async_trait;
use cadence_common::{MeasurementEvent, MetricKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM_SIZE: usize = 65_535;

pub struct UdpServer {
    socket: UdpSocket,
    stats_interval: Duration,
}

impl UdpServer {
    pub async fn bind(def: &ServerDef) -> Result<Self> {
        let socket = UdpSocket::bind((def.bind.as_str(), def.port))
            .await
            .map_err(|e| {
                CadenceError::init("udp server", format!("bind {}:{}: {}", def.bind, def.port, e))
            })?;
        Ok(Self {
            socket,
            stats_interval: Duration::from_millis(def.stats_export_interval_msec.max(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn stats_event(&self, packets: u64, bytes: u64) -> MeasurementEvent {
        MeasurementEvent::new(MetricKind::Cumulative)
            .with_label("module", "server")
            .with_label("type", ServerType::Udp.as_str())
            .with_value("total_packets", packets)
            .with_value("total_bytes", bytes)
    }
}

#[async_trait]
impl Server for UdpServer {
    async fn start(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>) {
        if let Ok(addr) = self.socket.local_addr() {
            info!(%addr, "UDP server listening");
        }

        let mut ticker = tokio::time::interval(self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut packets = 0u64;
        let mut bytes = 0u64;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(self.stats_event(packets, bytes)).await.is_err() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "UDP receive failed");
                            continue;
                        }
                    };
                    packets += 1;
                    bytes += len as u64;
                    if let Err(e) = self.socket.send_to(&buf[..len], peer).await {
                        debug!(%peer, error = %e, "UDP echo failed");
                    }
                }
            }
        }
        debug!(packets, bytes, "UDP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_STATS_EXPORT_INTERVAL_MSEC;
    use cadence_common::Value;
    use std::sync::Arc;

    fn def(stats_msec: u64) -> ServerDef {
        ServerDef {
            server_type: ServerType::Udp,
            bind: "127.0.0.1".to_string(),
            port: 0,
            stats_export_interval_msec: stats_msec,
        }
    }

    #[tokio::test]
    async fn test_echo_and_stats() {
        let server = Arc::new(UdpServer::bind(&def(50)).await.unwrap());
        let addr = server.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let server = Arc::clone(&server);
            let token = token.clone();
            async move { server.start(token, tx).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");

        let mut seen = None;
        for _ in 0..20 {
            let event = rx.recv().await.unwrap();
            if event.value("total_packets") == Some(&Value::Int(1)) {
                seen = Some(event);
                break;
            }
        }
        let event = seen.unwrap();
        assert_eq!(event.value("total_bytes"), Some(&Value::Int(4)));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_init_error() {
        let server = UdpServer::bind(&def(DEFAULT_STATS_EXPORT_INTERVAL_MSEC))
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let mut taken = def(DEFAULT_STATS_EXPORT_INTERVAL_MSEC);
        taken.port = port;
        let err = UdpServer::bind(&taken).await.err().unwrap();
        assert!(err.to_string().contains("udp server"));
    }
}
