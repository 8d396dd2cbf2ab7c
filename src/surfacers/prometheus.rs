//! Prometheus surfacer
//!
//! Every numeric value of an event becomes a gauge named
//! `<prefix><value name>`, labelled with the event's labels. The first event
//! seen for a metric fixes its label names; later events with a different
//! label set for the same metric are skipped.

use super::{EventQueue, Surfacer};
use cadence_common::MeasurementEvent;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PrometheusSurfacer {
    registry: Registry,
    queue: EventQueue,
}

impl PrometheusSurfacer {
    pub fn new(name: &str, prefix: &str, queue_size: usize) -> Self {
        let registry = Registry::new();
        let mut exporter = GaugeExporter::new(registry.clone(), prefix);
        let owner = name.to_string();
        let queue = EventQueue::spawn(name, queue_size, move |mut rx| async move {
            while let Some(event) = rx.recv().await {
                exporter.record(&event);
            }
            debug!(surfacer = %owner, "Prometheus surfacer stopped");
        });
        Self { registry, queue }
    }

    /// Current metrics in the text exposition format.
    pub fn render(&self) -> String {
        render(&self.registry)
    }
}

impl Surfacer for PrometheusSurfacer {
    fn write(&self, event: Arc<MeasurementEvent>) {
        self.queue.push(event);
    }
}

fn render(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

struct Gauge {
    label_names: Vec<String>,
    vec: GaugeVec,
}

struct GaugeExporter {
    registry: Registry,
    prefix: String,
    gauges: HashMap<String, Gauge>,
    /// Metrics that could not be created; events for them are skipped quietly.
    rejected: HashSet<String>,
}

impl GaugeExporter {
    fn new(registry: Registry, prefix: &str) -> Self {
        Self {
            registry,
            prefix: prefix.to_string(),
            gauges: HashMap::new(),
            rejected: HashSet::new(),
        }
    }

    fn record(&mut self, event: &MeasurementEvent) {
        let label_names: Vec<String> = event.labels().iter().map(|(k, _)| sanitize(k)).collect();
        let label_values: Vec<&str> = event.labels().iter().map(|(_, v)| v.as_str()).collect();

        for (name, value) in event.values() {
            let Some(value) = value.as_f64() else {
                continue;
            };
            let metric = sanitize(&format!("{}{}", self.prefix, name));
            let Some(gauge) = self.gauge(&metric, &label_names) else {
                continue;
            };
            if gauge.label_names != label_names {
                debug!(metric = %metric, "Label set differs from the registered one, skipping");
                continue;
            }
            match gauge.vec.get_metric_with_label_values(&label_values) {
                Ok(g) => g.set(value),
                Err(e) => debug!(metric = %metric, error = %e, "Cannot set gauge"),
            }
        }
    }

    fn gauge(&mut self, metric: &str, label_names: &[String]) -> Option<&Gauge> {
        if self.rejected.contains(metric) {
            return None;
        }
        if !self.gauges.contains_key(metric) {
            let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
            let opts = Opts::new(metric, format!("cadence measurement {}", metric));
            let vec = match GaugeVec::new(opts, &names) {
                Ok(vec) => vec,
                Err(e) => {
                    warn!(metric = %metric, error = %e, "Cannot create gauge, skipping metric");
                    self.rejected.insert(metric.to_string());
                    return None;
                }
            };
            if let Err(e) = self.registry.register(Box::new(vec.clone())) {
                warn!(metric = %metric, error = %e, "Cannot register gauge, skipping metric");
                self.rejected.insert(metric.to_string());
                return None;
            }
            self.gauges.insert(
                metric.to_string(),
                Gauge {
                    label_names: label_names.to_vec(),
                    vec,
                },
            );
        }
        self.gauges.get(metric)
    }
}

/// Replace characters Prometheus does not accept in names with `_`.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::MetricKind;
    use std::time::Duration;

    fn event(dst: &str, success: u64) -> MeasurementEvent {
        MeasurementEvent::new(MetricKind::Cumulative)
            .with_label("ptype", "tcp")
            .with_label("dst", dst)
            .with_value("success", success)
            .with_value("note", "ignored")
    }

    #[test]
    fn test_record_sets_gauges() {
        let registry = Registry::new();
        let mut exporter = GaugeExporter::new(registry.clone(), "cadence_");
        exporter.record(&event("web-1", 3));
        exporter.record(&event("web-2", 5));

        let text = render(&registry);
        assert!(text.contains(r#"cadence_success{dst="web-1",ptype="tcp"} 3"#));
        assert!(text.contains(r#"cadence_success{dst="web-2",ptype="tcp"} 5"#));
        assert!(!text.contains("note"));
    }

    #[test]
    fn test_mismatched_labels_skipped() {
        let registry = Registry::new();
        let mut exporter = GaugeExporter::new(registry.clone(), "");
        exporter.record(&event("web-1", 1));
        exporter.record(
            &MeasurementEvent::new(MetricKind::Gauge)
                .with_label("other", "x")
                .with_value("success", 9u64),
        );

        let text = render(&registry);
        assert!(text.contains("success{"));
        assert!(!text.contains("other="));
    }

    #[test]
    fn test_colliding_labels_rejected_once() {
        let registry = Registry::new();
        let mut exporter = GaugeExporter::new(registry.clone(), "");
        let clash = MeasurementEvent::new(MetricKind::Gauge)
            .with_label("a.b", "1")
            .with_label("a_b", "2")
            .with_value("rtt", 4u64);
        exporter.record(&clash);
        exporter.record(&clash);

        assert!(exporter.rejected.contains("rtt"));
        assert!(exporter.gauges.is_empty());
        assert!(!render(&registry).contains("rtt"));

        // Other metrics are unaffected.
        exporter.record(&event("web-1", 2));
        assert!(render(&registry).contains(r#"success{dst="web-1",ptype="tcp"} 2"#));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("latency.p99"), "latency_p99");
        assert_eq!(sanitize("9lives"), "_9lives");
    }

    #[tokio::test]
    async fn test_surfacer_renders_written_events() {
        let surfacer = PrometheusSurfacer::new("prometheus", "", 16);
        surfacer.write(Arc::new(event("db-1", 7)));

        let mut text = String::new();
        for _ in 0..100 {
            text = surfacer.render();
            if text.contains("db-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(text.contains(r#"success{dst="db-1",ptype="tcp"} 7"#));
    }
}
