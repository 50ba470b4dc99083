//! Retry with backoff+jitter, per-dependency circuit breakers, a metrics
//! collector, and the four fixed alert rules (`spec.md` §4.4).

pub mod alerts;
pub mod circuit;
pub mod metrics;
pub mod retry;

pub use alerts::{AlertEngine, AlertEvent, AlertSeverity, AlertState, LogSink, NotificationSink, RuleStatus};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitManager, CircuitOutcome, CircuitState};
pub use metrics::{DailySummary, LatencyPercentiles, MetricsCollector, Snapshot};
pub use retry::{retry_async, RetryPolicy};
