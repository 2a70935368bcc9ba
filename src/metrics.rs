//! In-process metrics: latency histograms and event counters.
//! Histograms track p50/p95/p99 for embed, search, generate and rebuild timings;
//! counters track degraded searches and skipped slang variants.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Samples kept per histogram; older samples are overwritten.
const RING_CAPACITY: usize = 1024;

/// Elapsed time from `MetricsRegistry::span` to `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn finish(self) {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
    }
}

struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    len: usize,
}

impl SampleRing {
    fn new() -> Self {
        Self {
            samples: vec![0.0; RING_CAPACITY],
            pos: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % RING_CAPACITY;
        self.len = (self.len + 1).min(RING_CAPACITY);
    }

    /// p50/p95/p99 over the retained samples (nearest rank).
    fn summarize(&self) -> MetricSummary {
        let mut sorted = self.samples[..self.len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let at = |p: f64| {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        MetricSummary {
            p50_us: at(50.0),
            p95_us: at(95.0),
            p99_us: at(99.0),
            count: self.len,
        }
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(SampleRing::new)
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn incr(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Current value of every counter that has fired.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(name, n)| (name.to_string(), *n))
            .collect()
    }

    /// Latency summary of every histogram with samples.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(name, ring)| (name.to_string(), ring.summarize()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names.
pub mod metric_names {
    pub const EMBED: &str = "t_embed";
    pub const NEAREST_SEARCH: &str = "t_nearest_search";
    pub const GENERATE: &str = "t_generate";
    pub const TRANSLATE_HIT: &str = "t_translate_hit";
    pub const TRANSLATE_MISS: &str = "t_translate_miss";
    pub const REBUILD_PASS: &str = "t_rebuild_pass";
    pub const SNAPSHOT_BUILD: &str = "t_snapshot_build";
    // Counters
    pub const SEARCH_DEGRADED: &str = "search_degraded";
    pub const VARIANT_SKIPPED: &str = "variant_skipped";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_recorded_samples() {
        let reg = MetricsRegistry::new();
        for v in 1..=100 {
            reg.record(metric_names::EMBED, v as f64);
        }
        let s = &reg.summary()[metric_names::EMBED];
        assert_eq!(s.p50_us, 51.0);
        assert_eq!(s.p99_us, 99.0);
        assert_eq!(s.count, 100);
        assert!(!reg.summary().contains_key(metric_names::GENERATE));
    }

    #[test]
    fn ring_keeps_only_latest_samples() {
        let reg = MetricsRegistry::new();
        for _ in 0..10 {
            reg.record(metric_names::GENERATE, 1_000_000.0);
        }
        for _ in 0..RING_CAPACITY {
            reg.record(metric_names::GENERATE, 5.0);
        }
        let s = &reg.summary()[metric_names::GENERATE];
        assert_eq!(s.count, RING_CAPACITY);
        assert_eq!(s.p99_us, 5.0);
    }

    #[test]
    fn span_records_on_finish() {
        let reg = Arc::new(MetricsRegistry::new());
        reg.span(metric_names::REBUILD_PASS).finish();
        assert_eq!(reg.summary()[metric_names::REBUILD_PASS].count, 1);
    }

    #[test]
    fn counters_accumulate() {
        let reg = MetricsRegistry::new();
        reg.incr(metric_names::SEARCH_DEGRADED);
        reg.incr(metric_names::SEARCH_DEGRADED);
        assert_eq!(reg.count(metric_names::SEARCH_DEGRADED), 2);
        assert_eq!(reg.count(metric_names::VARIANT_SKIPPED), 0);
        assert_eq!(reg.counters().len(), 1);
    }
}
