//! The four fixed alert rules evaluated against a metrics snapshot, each
//! with its own cooldown and firing/resolved transition history — grounded
//! in the teacher's `AlertManager`/`Alert`/`AlertRule` machinery
//! (`enterprise/analytics/alerting.rs`), generalized from an arbitrary
//! named-metric rule set down to the four rules `spec.md` §4.4 specifies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use super::metrics::Snapshot;

const MAX_HISTORY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Ok,
    Firing,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub rule: &'static str,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub message: String,
}

/// Anything that wants to learn about a state transition. Production wiring
/// uses [`LogSink`]; tests can substitute a capturing sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &AlertEvent);
}

pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &AlertEvent) {
        match event.severity {
            AlertSeverity::Critical => tracing::error!(rule = event.rule, "{}", event.message),
            AlertSeverity::Warning => tracing::warn!(rule = event.rule, "{}", event.message),
            AlertSeverity::Info => tracing::info!(rule = event.rule, "{}", event.message),
        }
    }
}

struct RuleDef {
    name: &'static str,
    severity: AlertSeverity,
    cooldown: Duration,
    check: fn(&Snapshot) -> Option<String>,
}

fn low_success_rate(s: &Snapshot) -> Option<String> {
    (s.total > 0 && s.success_rate < 0.95)
        .then(|| format!("success rate {:.1}% below 95%", s.success_rate * 100.0))
}

fn critical_success_rate(s: &Snapshot) -> Option<String> {
    (s.total > 0 && s.success_rate < 0.80)
        .then(|| format!("success rate {:.1}% below 80%", s.success_rate * 100.0))
}

fn high_latency(s: &Snapshot) -> Option<String> {
    (s.avg_latency_ms / 1000.0 > 30.0).then(|| format!("average latency {:.1}s exceeds 30s", s.avg_latency_ms / 1000.0))
}

fn low_cache_hit_rate(s: &Snapshot) -> Option<String> {
    ((s.cache_hit + s.cache_miss) > 0 && s.cache_hit_rate < 0.50)
        .then(|| format!("cache hit rate {:.1}% below 50%", s.cache_hit_rate * 100.0))
}

const RULES: &[RuleDef] = &[
    RuleDef { name: "low_success_rate", severity: AlertSeverity::Warning, cooldown: Duration::from_secs(600), check: low_success_rate },
    RuleDef { name: "critical_success_rate", severity: AlertSeverity::Critical, cooldown: Duration::from_secs(300), check: critical_success_rate },
    RuleDef { name: "high_latency", severity: AlertSeverity::Warning, cooldown: Duration::from_secs(600), check: high_latency },
    RuleDef { name: "low_cache_hit_rate", severity: AlertSeverity::Info, cooldown: Duration::from_secs(1800), check: low_cache_hit_rate },
];

#[derive(Clone, Serialize)]
pub struct RuleStatus {
    pub rule: &'static str,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub message: Option<String>,
}

struct RuleRuntime {
    state: AlertState,
    /// When a firing notification may next be re-sent while still firing,
    /// or a silence set by the admin surface pushed past `Instant::now()`.
    next_eligible: Instant,
}

/// Evaluates the four fixed rules against a [`Snapshot`], debounced by a
/// per-rule cooldown so a flapping metric doesn't spam the sink, and keeps a
/// bounded transition history for the admin surface.
pub struct AlertEngine {
    sink: Arc<dyn NotificationSink>,
    runtime: RwLock<Vec<RuleRuntime>>,
    history: RwLock<VecDeque<AlertEvent>>,
}

impl AlertEngine {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let runtime = RULES.iter().map(|_| RuleRuntime { state: AlertState::Ok, next_eligible: Instant::now() }).collect();
        Self { sink, runtime: RwLock::new(runtime), history: RwLock::new(VecDeque::new()) }
    }

    /// Evaluate every rule, firing or resolving as needed, and return the
    /// current status of all four for the admin surface.
    pub fn check(&self, snapshot: &Snapshot) -> Vec<RuleStatus> {
        let now = Instant::now();
        let mut runtime = self.runtime.write();
        let mut statuses = Vec::with_capacity(RULES.len());

        for (rule, rt) in RULES.iter().zip(runtime.iter_mut()) {
            let message = (rule.check)(snapshot);
            match (&rt.state, &message) {
                (AlertState::Ok, Some(msg)) => {
                    rt.state = AlertState::Firing;
                    self.emit(rule, AlertState::Firing, msg.clone());
                    rt.next_eligible = now + rule.cooldown;
                }
                (AlertState::Firing, Some(msg)) if now >= rt.next_eligible => {
                    self.emit(rule, AlertState::Firing, msg.clone());
                    rt.next_eligible = now + rule.cooldown;
                }
                (AlertState::Firing, None) => {
                    rt.state = AlertState::Ok;
                    self.emit(rule, AlertState::Ok, format!("{} recovered", rule.name));
                }
                _ => {}
            }

            statuses.push(RuleStatus { rule: rule.name, severity: rule.severity, state: rt.state, message });
        }

        statuses
    }

    fn emit(&self, rule: &RuleDef, state: AlertState, message: String) {
        let event = AlertEvent { rule: rule.name, severity: rule.severity, state, message };
        self.sink.notify(&event);
        let mut history = self.history.write();
        history.push_back(event);
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    /// Suppress further notifications for `rule` until `until` elapses,
    /// without changing its evaluated state.
    pub fn silence(&self, rule_name: &str, duration: Duration) -> bool {
        let mut runtime = self.runtime.write();
        for (rule, rt) in RULES.iter().zip(runtime.iter_mut()) {
            if rule.name == rule_name {
                rt.next_eligible = Instant::now() + duration;
                return true;
            }
        }
        false
    }

    pub fn history(&self) -> Vec<AlertEvent> {
        self.history.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::metrics::MetricsCollector;
    use std::sync::Mutex;

    struct CaptureSink(Mutex<Vec<AlertEvent>>);

    impl NotificationSink for CaptureSink {
        fn notify(&self, event: &AlertEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn fires_low_success_rate_once_then_waits_for_cooldown() {
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        let engine = AlertEngine::new(sink.clone());
        let metrics = MetricsCollector::new();
        for _ in 0..10 {
            metrics.record_outcome("high", "upstream", false, 10.0);
        }
        metrics.record_outcome("high", "upstream", true, 10.0);

        engine.check(&metrics.snapshot());
        engine.check(&metrics.snapshot());

        let events = sink.0.lock().unwrap();
        let firing: Vec<_> = events.iter().filter(|e| e.rule == "low_success_rate").collect();
        assert_eq!(firing.len(), 1);
    }

    #[test]
    fn resolves_when_metrics_recover() {
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        let engine = AlertEngine::new(sink.clone());
        let metrics = MetricsCollector::new();
        for _ in 0..10 {
            metrics.record_outcome("high", "upstream", false, 10.0);
        }
        engine.check(&metrics.snapshot());
        for _ in 0..200 {
            metrics.record_outcome("high", "upstream", true, 10.0);
        }
        engine.check(&metrics.snapshot());

        let events = sink.0.lock().unwrap();
        assert!(events.iter().any(|e| e.rule == "low_success_rate" && e.state == AlertState::Ok));
    }
}
