//! Event distribution
//!
//! Every producer (probes, servers, sysvars) writes into one bounded
//! channel. A single consumer reads it, drops oversized events and hands each
//! remaining event to every surfacer in registration order.

use crate::surfacers::SurfacerInfo;
use cadence_common::MeasurementEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the shared event channel. Producers wait when it is full.
pub const DATA_CHANNEL_CAPACITY: usize = 100_000;

/// Longest accepted rendered event, in bytes.
pub const MAX_LOG_ENTRY_SIZE: usize = 4096;

pub fn channel() -> (mpsc::Sender<MeasurementEvent>, mpsc::Receiver<MeasurementEvent>) {
    mpsc::channel(DATA_CHANNEL_CAPACITY)
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    /// Events delivered to surfacers.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Events dropped for being too large.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct EventPipeline {
    surfacers: Vec<SurfacerInfo>,
    stats: Arc<PipelineStats>,
}

impl EventPipeline {
    pub fn new(surfacers: Vec<SurfacerInfo>) -> Self {
        Self::with_stats(surfacers, Arc::new(PipelineStats::default()))
    }

    /// Pipeline that reports into existing counters.
    pub fn with_stats(surfacers: Vec<SurfacerInfo>, stats: Arc<PipelineStats>) -> Self {
        Self { surfacers, stats }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Consume `rx` until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<MeasurementEvent>) {
        info!(surfacers = self.surfacers.len(), "Event pipeline started");
        while let Some(event) = rx.recv().await {
            self.dispatch(event);
        }
        info!(
            processed = self.stats.processed(),
            dropped = self.stats.dropped(),
            "Event pipeline stopped"
        );
    }

    fn dispatch(&self, event: MeasurementEvent) {
        let size = event.to_string().len();
        if size > MAX_LOG_ENTRY_SIZE {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                size,
                limit = MAX_LOG_ENTRY_SIZE,
                "Dropping event larger than the maximum entry size"
            );
            return;
        }

        let event = Arc::new(event);
        for info in &self.surfacers {
            info.surfacer.write(Arc::clone(&event));
        }
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        debug!(size, "Event distributed");
    }
}
