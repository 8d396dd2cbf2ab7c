//! Jittered probe start-up
//!
//! Probes sharing an interval form a bucket. Each bucket waits a random
//! delay in `[0, interval)` and then starts its probes one by one,
//! `interval / count` apart, so probes of the same interval are spread over
//! the whole interval instead of firing together.

use crate::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Starts a registered probe by name.
#[async_trait]
pub trait ProbeStarter: Send + Sync {
    async fn start_probe(&self, name: &str) -> Result<()>;
}

/// Group probes by interval. Names inside a bucket are sorted.
pub fn interval_buckets<I>(probes: I) -> BTreeMap<Duration, Vec<String>>
where
    I: IntoIterator<Item = (String, Duration)>,
{
    let mut buckets: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
    for (name, interval) in probes {
        buckets.entry(interval).or_default().push(name);
    }
    for names in buckets.values_mut() {
        names.sort();
    }
    buckets
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPlan {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub spacing: Duration,
    pub probes: Vec<String>,
}

pub struct JitterScheduler {
    rng: StdRng,
}

impl JitterScheduler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic scheduler for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn plan(&mut self, buckets: BTreeMap<Duration, Vec<String>>) -> Vec<BucketPlan> {
        buckets
            .into_iter()
            .filter(|(_, probes)| !probes.is_empty())
            .map(|(interval, probes)| {
                let initial_delay = self.initial_delay(interval);
                let count = u32::try_from(probes.len()).unwrap_or(u32::MAX);
                BucketPlan {
                    interval,
                    initial_delay,
                    spacing: interval / count,
                    probes,
                }
            })
            .collect()
    }

    fn initial_delay(&mut self, interval: Duration) -> Duration {
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.random_range(0..nanos))
    }

    /// Spawn one task per bucket. Tasks exit early once `token` is cancelled.
    pub fn schedule(
        mut self,
        buckets: BTreeMap<Duration, Vec<String>>,
        starter: Arc<dyn ProbeStarter>,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.plan(buckets)
            .into_iter()
            .map(|plan| {
                let starter = Arc::clone(&starter);
                let token = token.clone();
                tokio::spawn(run_bucket(plan, starter, token))
            })
            .collect()
    }
}

impl Default for JitterScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_bucket(plan: BucketPlan, starter: Arc<dyn ProbeStarter>, token: CancellationToken) {
    debug!(
        interval_ms = plan.interval.as_millis() as u64,
        delay_ms = plan.initial_delay.as_millis() as u64,
        probes = plan.probes.len(),
        "Scheduling probe bucket"
    );

    if !sleep_or_cancel(plan.initial_delay, &token).await {
        return;
    }

    for (i, name) in plan.probes.iter().enumerate() {
        if i > 0 && !sleep_or_cancel(plan.spacing, &token).await {
            return;
        }
        if let Err(e) = starter.start_probe(name).await {
            warn!(probe = %name, error = %e, "Jittered start failed");
        }
    }
}

/// Returns false if cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
