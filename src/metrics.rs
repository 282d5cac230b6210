//! Counter registry with per-connection buffering.
//!
//! Each connection task owns a [`MetricsRecorder`] that buffers increments
//! locally and flushes them into the shared [`MetricsRegistry`] at event
//! boundaries. Merging is commutative, so flush order across connections
//! does not matter.
//!
//! Metric names follow Prometheus conventions: `authmilter_` prefix,
//! `_total` suffix for counters, bounded label sets (stage, handler, type).

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

pub const CONNECT_TOTAL: &str = "authmilter_connect_total";
pub const CALLBACK_ERROR_TOTAL: &str = "authmilter_callback_error_total";
pub const TIME_MICROSECONDS_TOTAL: &str = "authmilter_time_microseconds_total";

/// Sorted label pairs; sorting makes equal label sets compare equal.
pub type LabelSet = Vec<(String, String)>;

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    let mut labels: LabelSet = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    labels.sort();
    labels
}

#[derive(Default)]
struct RegistryInner {
    help: BTreeMap<String, String>,
    counters: BTreeMap<String, BTreeMap<LabelSet, u64>>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<RegistryInner>,
}

impl MetricsRegistry {
    /// A registry with the pipeline's own metrics pre-registered. Handlers
    /// add theirs through `register` during setup.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self::default());
        registry.register(CONNECT_TOTAL, "Number of connections made to authentication milter");
        registry.register(
            CALLBACK_ERROR_TOTAL,
            "Number of errors in callbacks",
        );
        registry.register(
            TIME_MICROSECONDS_TOTAL,
            "Total time in microseconds spent in handler callbacks",
        );
        registry
    }

    pub fn register(&self, id: &str, help: &str) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        inner.help.insert(id.to_string(), help.to_string());
        inner.counters.entry(id.to_string()).or_default();
    }

    fn merge(&self, buffer: &HashMap<(String, LabelSet), u64>) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        for ((id, labels), count) in buffer {
            *inner
                .counters
                .entry(id.clone())
                .or_default()
                .entry(labels.clone())
                .or_insert(0) += count;
        }
    }

    /// The aggregated value of one counter series.
    pub fn get(&self, id: &str, label_pairs: &[(&str, &str)]) -> u64 {
        let wanted = labels(label_pairs);
        let inner = self.inner.lock().expect("metrics registry poisoned");
        inner
            .counters
            .get(id)
            .and_then(|series| series.get(&wanted))
            .copied()
            .unwrap_or(0)
    }

    /// Sum across every label combination of one counter.
    pub fn get_summed(&self, id: &str) -> u64 {
        let inner = self.inner.lock().expect("metrics registry poisoned");
        inner
            .counters
            .get(id)
            .map(|series| series.values().sum())
            .unwrap_or(0)
    }

    /// Prometheus text exposition of every registered counter.
    pub fn render(&self) -> String {
        let inner = self.inner.lock().expect("metrics registry poisoned");
        let mut out = String::new();
        for (id, series) in &inner.counters {
            if let Some(help) = inner.help.get(id) {
                out.push_str(&format!("# HELP {id} {help}\n"));
                out.push_str(&format!("# TYPE {id} counter\n"));
            }
            if series.is_empty() {
                out.push_str(&format!("{id} 0\n"));
                continue;
            }
            for (labels, count) in series {
                if labels.is_empty() {
                    out.push_str(&format!("{id} {count}\n"));
                } else {
                    let rendered: Vec<String> = labels
                        .iter()
                        .map(|(name, value)| format!("{name}=\"{value}\""))
                        .collect();
                    out.push_str(&format!("{id}{{{}}} {count}\n", rendered.join(",")));
                }
            }
        }
        out
    }
}

/// Connection-local counter buffer.
pub struct MetricsRecorder {
    registry: Arc<MetricsRegistry>,
    buffer: HashMap<(String, LabelSet), u64>,
}

impl MetricsRecorder {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            buffer: HashMap::new(),
        }
    }

    pub fn count(&mut self, id: &str, label_pairs: &[(&str, &str)], count: u64) {
        *self
            .buffer
            .entry((id.to_string(), labels(label_pairs)))
            .or_insert(0) += count;
    }

    /// Flush buffered counts into the shared registry.
    pub fn send(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.registry.merge(&self.buffer);
        self.buffer.clear();
    }
}

impl Drop for MetricsRecorder {
    fn drop(&mut self) {
        self.send();
    }
}
