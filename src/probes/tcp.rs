//! TCP connect probe
//!
//! Every interval, opens a TCP connection to each target and records
//! cumulative `total`, `success` and `latency` (microseconds) per target
//! host and port. Definition labels never override `ptype`, `probe`, `dst`
//! or `port`.

use super::{Probe, ProbeOptions, ProbeType};
use async_trait::async_trait;
use cadence_common::{MeasurementEvent, MetricKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct TargetStats {
    total: u64,
    success: u64,
    latency_us: u64,
}

pub struct TcpProbe {
    opts: ProbeOptions,
}

impl TcpProbe {
    pub fn new(opts: ProbeOptions) -> Self {
        Self { opts }
    }

    async fn connect(&self, host: &str, port: u16) -> Option<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(self.opts.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Some(start.elapsed()),
            Ok(Err(e)) => {
                debug!(probe = %self.opts.name, target = host, error = %e, "Connect failed");
                None
            }
            Err(_) => {
                debug!(probe = %self.opts.name, target = host, "Connect timed out");
                None
            }
        }
    }

    fn event(&self, target: &str, port: u16, stats: &TargetStats) -> MeasurementEvent {
        let mut event = MeasurementEvent::new(MetricKind::Cumulative);
        for (k, v) in &self.opts.labels {
            event = event.with_label(k.as_str(), v.as_str());
        }
        event
            .with_label("ptype", ProbeType::Tcp.as_str())
            .with_label("probe", self.opts.name.as_str())
            .with_label("dst", target)
            .with_label("port", port.to_string())
            .with_value("total", stats.total)
            .with_value("success", stats.success)
            .with_value("latency", stats.latency_us)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn start(&self, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>) {
        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats: HashMap<(String, u16), TargetStats> = HashMap::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for endpoint in self.opts.targets.list_endpoints() {
                let Some(port) = endpoint.port.or(self.opts.port) else {
                    debug!(probe = %self.opts.name, target = %endpoint.name, "No port for target, skipping");
                    continue;
                };

                let latency = tokio::select! {
                    _ = token.cancelled() => return,
                    latency = self.connect(&endpoint.name, port) => latency,
                };

                let entry = stats.entry((endpoint.name.clone(), port)).or_default();
                entry.total += 1;
                if let Some(latency) = latency {
                    entry.success += 1;
                    entry.latency_us += latency.as_micros() as u64;
                }

                let event = self.event(&endpoint.name, port, entry);
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!(probe = %self.opts.name, "TCP probe stopped");
    }
}
