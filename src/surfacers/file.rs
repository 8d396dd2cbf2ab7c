//! Line-oriented surfacers: one rendered event per line, to stdout or to an
//! append-only file.

use super::{EventQueue, Surfacer};
use crate::{CadenceError, Result};
use cadence_common::MeasurementEvent;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct LineSurfacer {
    queue: EventQueue,
}

impl LineSurfacer {
    pub fn stdout(name: &str, queue_size: usize) -> Self {
        Self::with_writer(name, tokio::io::stdout(), queue_size)
    }

    pub async fn file(name: &str, path: &Path, queue_size: usize) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                CadenceError::init(
                    format!("surfacer {}", name),
                    format!("cannot open {}: {}", path.display(), e),
                )
            })?;
        debug!(surfacer = name, path = %path.display(), "Opened surfacer file");
        Ok(Self::with_writer(name, file, queue_size))
    }

    pub fn with_writer<W>(name: &str, writer: W, queue_size: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let owner = name.to_string();
        let queue = EventQueue::spawn(name, queue_size, move |rx| write_lines(owner, writer, rx));
        Self { queue }
    }
}

impl Surfacer for LineSurfacer {
    fn write(&self, event: Arc<MeasurementEvent>) {
        self.queue.push(event);
    }
}

async fn write_lines<W>(name: String, mut writer: W, mut rx: mpsc::Receiver<Arc<MeasurementEvent>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let line = format!("{}\n", event);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(surfacer = %name, error = %e, "Failed to write event");
            continue;
        }
        if let Err(e) = writer.flush().await {
            warn!(surfacer = %name, error = %e, "Failed to flush");
        }
    }
    debug!(surfacer = %name, "Line surfacer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::MetricKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_file_gets_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let surfacer = LineSurfacer::file("file", &path, 16).await.unwrap();

        for target in ["a", "b"] {
            let event = MeasurementEvent::new(MetricKind::Cumulative)
                .with_label("dst", target)
                .with_value("success", 1u64);
            surfacer.write(Arc::new(event));
        }

        let mut contents = String::new();
        for _ in 0..100 {
            contents = tokio::fs::read_to_string(&path).await.unwrap();
            if contents.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("labels=dst=a"));
        assert!(lines[1].ends_with("success=1"));
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_init() {
        let err = LineSurfacer::file("file", Path::new("/nonexistent/dir/events.log"), 16)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("surfacer file"));
    }
}
