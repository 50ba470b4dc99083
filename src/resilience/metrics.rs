//! In-process metrics: request outcome counters, per-source cache counters,
//! per-action counters, a bounded-window latency summary for percentile
//! queries, and a 30-day daily rollup — grounded in the teacher's
//! `Counter`/`Summary` primitives (`enterprise/analytics/metrics.rs`),
//! generalized from a generic named-metric registry to the fixed set of
//! counters `spec.md` §4.4 calls for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;

const LATENCY_WINDOW: usize = 1000;
const DAILY_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity ring of recent latencies for percentile queries. Older
/// samples are dropped once the window fills, the same way the teacher's
/// `Summary` caps `values` at `max_values`.
#[derive(Default)]
struct LatencyWindow {
    samples: Vec<f64>,
    cursor: usize,
}

impl LatencyWindow {
    fn observe(&mut self, millis: f64) {
        if self.samples.len() < LATENCY_WINDOW {
            self.samples.push(millis);
        } else {
            self.samples[self.cursor] = millis;
            self.cursor = (self.cursor + 1) % LATENCY_WINDOW;
        }
    }

    fn percentile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = (((sorted.len() - 1) as f64) * q).round() as usize;
        sorted[idx]
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DailySummary {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub by_source: HashMap<&'static str, u64>,
    pub by_action: HashMap<String, u64>,
    pub failures_by_action: HashMap<String, u64>,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

/// Collects the counters the admin surface and the alert engine both read.
/// Cheap to clone: everything is behind `Arc`.
#[derive(Clone)]
pub struct MetricsCollector {
    total: Arc<Counter>,
    success: Arc<Counter>,
    fail: Arc<Counter>,
    cache_hit: Arc<Counter>,
    cache_miss: Arc<Counter>,
    by_source: Arc<RwLock<HashMap<&'static str, Arc<Counter>>>>,
    by_action: Arc<RwLock<HashMap<String, Arc<Counter>>>>,
    failures_by_action: Arc<RwLock<HashMap<String, Arc<Counter>>>>,
    latency: Arc<RwLock<LatencyWindow>>,
    daily: Arc<RwLock<HashMap<NaiveDate, DailySummary>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total: Arc::new(Counter::default()),
            success: Arc::new(Counter::default()),
            fail: Arc::new(Counter::default()),
            cache_hit: Arc::new(Counter::default()),
            cache_miss: Arc::new(Counter::default()),
            by_source: Arc::new(RwLock::new(HashMap::new())),
            by_action: Arc::new(RwLock::new(HashMap::new())),
            failures_by_action: Arc::new(RwLock::new(HashMap::new())),
            latency: Arc::new(RwLock::new(LatencyWindow::default())),
            daily: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one fetch attempt's outcome. `source` is `"l1"`, `"l2"`,
    /// `"l3"`, or `"fresh"`; pass `"miss"` when nothing served it and the
    /// request failed outright.
    pub fn record_outcome(&self, action: &str, source: &'static str, success: bool, latency_ms: f64) {
        self.total.inc();
        if success {
            self.success.inc();
        } else {
            self.fail.inc();
            self.counter_for(&self.failures_by_action, action).inc();
        }
        self.counter_for_source(source).inc();
        self.counter_for(&self.by_action, action).inc();
        self.latency.write().observe(latency_ms);
        self.bump_daily(success);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hit.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_miss.inc();
    }

    fn counter_for_source(&self, source: &'static str) -> Arc<Counter> {
        self.by_source.write().entry(source).or_insert_with(|| Arc::new(Counter::default())).clone()
    }

    fn counter_for(&self, map: &RwLock<HashMap<String, Arc<Counter>>>, key: &str) -> Arc<Counter> {
        if let Some(c) = map.read().get(key) {
            return c.clone();
        }
        map.write().entry(key.to_string()).or_insert_with(|| Arc::new(Counter::default())).clone()
    }

    fn bump_daily(&self, success: bool) {
        let today = Utc::now().date_naive();
        let mut daily = self.daily.write();
        let entry = daily.entry(today).or_default();
        entry.total += 1;
        if success {
            entry.success += 1;
        } else {
            entry.fail += 1;
        }
        if daily.len() > DAILY_RETENTION_DAYS as usize {
            let cutoff = today - chrono::Duration::days(DAILY_RETENTION_DAYS);
            daily.retain(|date, _| *date >= cutoff);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let total = self.total.get();
        let success = self.success.get();
        let fail = self.fail.get();
        let cache_hit = self.cache_hit.get();
        let cache_miss = self.cache_miss.get();
        let cache_total = cache_hit + cache_miss;

        Snapshot {
            total,
            success,
            fail,
            cache_hit,
            cache_miss,
            success_rate: if total > 0 { success as f64 / total as f64 } else { 1.0 },
            cache_hit_rate: if cache_total > 0 { cache_hit as f64 / cache_total as f64 } else { 0.0 },
            by_source: self.by_source.read().iter().map(|(k, v)| (*k, v.get())).collect(),
            by_action: self.by_action.read().iter().map(|(k, v)| (k.clone(), v.get())).collect(),
            failures_by_action: self.failures_by_action.read().iter().map(|(k, v)| (k.clone(), v.get())).collect(),
            avg_latency_ms: self.latency.read().mean(),
        }
    }

    pub fn latency_percentiles(&self) -> LatencyPercentiles {
        let window = self.latency.read();
        LatencyPercentiles {
            p50: window.percentile(0.50),
            p90: window.percentile(0.90),
            p95: window.percentile(0.95),
            p99: window.percentile(0.99),
            samples: window.samples.len(),
        }
    }

    pub fn daily_summaries(&self) -> HashMap<NaiveDate, DailySummary> {
        self.daily.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_success_rate_and_latency() {
        let m = MetricsCollector::new();
        m.record_outcome("high", "l1", true, 5.0);
        m.record_outcome("high", "upstream", true, 500.0);
        m.record_outcome("hot", "upstream", false, 1200.0);

        let snap = m.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.fail, 1);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(*snap.failures_by_action.get("hot").unwrap(), 1);
    }

    #[test]
    fn cache_hit_rate_excludes_unrelated_fetch_outcomes() {
        let m = MetricsCollector::new();
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_miss();
        let snap = m.snapshot();
        assert!((snap.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn latency_window_reports_percentiles() {
        let m = MetricsCollector::new();
        for ms in 1..=100 {
            m.record_outcome("high", "l3", true, ms as f64);
        }
        let p = m.latency_percentiles();
        assert!((p.p50 - 50.0).abs() <= 1.0);
        assert!(p.p99 >= 98.0);
    }
}
