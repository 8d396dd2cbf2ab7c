//! System variables
//!
//! Process-level facts (hostname, version, start time, selected environment
//! variables) plus a periodic uptime event so surfacers can tell the agent is
//! alive.

use crate::VERSION;
use cadence_common::{MeasurementEvent, MetricKind};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SysVars {
    vars: BTreeMap<String, String>,
    started: Instant,
}

impl SysVars {
    /// Capture the local variables. `env_vars` names environment variables
    /// to export; unset ones are skipped.
    pub fn init(hostname: &str, env_vars: &[String]) -> Self {
        let start_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut vars = BTreeMap::new();
        vars.insert("hostname".to_string(), hostname.to_string());
        vars.insert("version".to_string(), VERSION.to_string());
        vars.insert("start_timestamp".to_string(), start_timestamp.to_string());
        for name in env_vars {
            if let Ok(value) = std::env::var(name) {
                vars.insert(name.clone(), value);
            }
        }

        Self {
            vars,
            started: Instant::now(),
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    fn uptime_event(&self) -> MeasurementEvent {
        let mut event = MeasurementEvent::new(MetricKind::Cumulative)
            .with_label("ptype", "sysvars")
            .with_label("probe", "sysvars");
        for (k, v) in &self.vars {
            if k != "start_timestamp" {
                event = event.with_label(k.as_str(), v.as_str());
            }
        }
        event.with_value("uptime_msec", self.started.elapsed().as_millis() as u64)
    }

    /// Export an uptime event every `interval` until cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken, tx: mpsc::Sender<MeasurementEvent>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(self.uptime_event()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Sysvars exporter stopped");
    }
}
