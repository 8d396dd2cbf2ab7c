//! Metric surfacers
//!
//! A surfacer receives every accepted measurement event. `write` is called
//! from the pipeline's single consumer task and must return immediately;
//! built-in surfacers hand events to their own background task through a
//! bounded [`EventQueue`] and drop events when it is full.

pub mod file;
pub mod prometheus;

use crate::config::SurfacerDef;
use crate::{CadenceError, Result};
use cadence_common::MeasurementEvent;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

pub trait Surfacer: Send + Sync {
    /// Accept an event without blocking.
    fn write(&self, event: Arc<MeasurementEvent>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfacerType {
    Stdout,
    File,
    Prometheus,
    /// Supplied programmatically, never built from configuration.
    UserDefined,
}

impl SurfacerType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SurfacerType::Stdout => "stdout",
            SurfacerType::File => "file",
            SurfacerType::Prometheus => "prometheus",
            SurfacerType::UserDefined => "user_defined",
        }
    }
}

impl std::fmt::Display for SurfacerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct SurfacerInfo {
    pub name: String,
    pub surfacer_type: SurfacerType,
    pub surfacer: Arc<dyn Surfacer>,
}

impl SurfacerInfo {
    pub fn new(name: impl Into<String>, surfacer_type: SurfacerType, surfacer: Arc<dyn Surfacer>) -> Self {
        Self {
            name: name.into(),
            surfacer_type,
            surfacer,
        }
    }
}

impl std::fmt::Debug for SurfacerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfacerInfo")
            .field("name", &self.name)
            .field("surfacer_type", &self.surfacer_type)
            .finish_non_exhaustive()
    }
}

/// Surfacers used when the configuration lists none.
pub fn default_defs() -> Vec<SurfacerDef> {
    vec![
        SurfacerDef::new(SurfacerType::Stdout),
        SurfacerDef::new(SurfacerType::Prometheus),
    ]
}

/// Build the configured surfacers, in configuration order. Must be called
/// from within a tokio runtime.
pub async fn init(defs: &[SurfacerDef]) -> Result<Vec<SurfacerInfo>> {
    let defaults;
    let defs = if defs.is_empty() {
        defaults = default_defs();
        &defaults[..]
    } else {
        defs
    };

    let mut surfacers = Vec::with_capacity(defs.len());
    for def in defs {
        let name = def.display_name();
        let surfacer: Arc<dyn Surfacer> = match def.surfacer_type {
            SurfacerType::Stdout => Arc::new(file::LineSurfacer::stdout(&name, def.queue_size)),
            SurfacerType::File => {
                let path = def.file_path.as_ref().ok_or_else(|| {
                    CadenceError::ConfigError(format!("surfacer {}: file_path is required", name))
                })?;
                Arc::new(file::LineSurfacer::file(&name, path, def.queue_size).await?)
            }
            SurfacerType::Prometheus => Arc::new(prometheus::PrometheusSurfacer::new(
                &name,
                def.metrics_prefix.as_deref().unwrap_or_default(),
                def.queue_size,
            )),
            SurfacerType::UserDefined => {
                return Err(CadenceError::ConfigError(format!(
                    "surfacer {}: user_defined surfacers cannot be built from configuration",
                    name
                )))
            }
        };
        info!(surfacer = %name, surfacer_type = %def.surfacer_type, "Surfacer initialized");
        surfacers.push(SurfacerInfo::new(name, def.surfacer_type, surfacer));
    }
    Ok(surfacers)
}

/// Non-blocking hand-off from `Surfacer::write` to a background task.
pub(crate) struct EventQueue {
    name: String,
    tx: mpsc::Sender<Arc<MeasurementEvent>>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub(crate) fn spawn<F, Fut>(name: &str, capacity: usize, consumer: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<Arc<MeasurementEvent>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(consumer(rx));
        Self {
            name: name.to_string(),
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, event: Arc<MeasurementEvent>) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(surfacer = %self.name, dropped, "Surfacer queue full, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(surfacer = %self.name, "Surfacer task is gone, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SURFACER_QUEUE_SIZE;
    use cadence_common::MetricKind;

    #[tokio::test]
    async fn test_init_defaults() {
        let surfacers = init(&[]).await.unwrap();
        let types: Vec<SurfacerType> = surfacers.iter().map(|s| s.surfacer_type).collect();
        assert_eq!(types, vec![SurfacerType::Stdout, SurfacerType::Prometheus]);
        assert_eq!(surfacers[0].name, "stdout");
    }

    #[tokio::test]
    async fn test_init_rejects_user_defined() {
        let err = init(&[SurfacerDef::new(SurfacerType::UserDefined)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user_defined"));
    }

    #[tokio::test]
    async fn test_queue_drops_when_full() {
        // The consumer never reads, so the queue fills after `capacity` events.
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        let queue = EventQueue::spawn("slow", 2, |rx| async move {
            let _rx = rx;
            let _ = hold_rx.await;
        });

        let event = Arc::new(MeasurementEvent::new(MetricKind::Gauge));
        for _ in 0..5 {
            queue.push(Arc::clone(&event));
        }
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 3);
        drop(hold_tx);
    }

    #[test]
    fn test_default_queue_size() {
        assert_eq!(SurfacerDef::new(SurfacerType::File).queue_size, DEFAULT_SURFACER_QUEUE_SIZE);
    }
}
