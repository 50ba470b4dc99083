//! Per-dependency circuit breakers, keyed by name so the dispatcher and any
//! future upstream dependency each get their own failure window — grounded
//! in the teacher's gateway `CircuitBreaker` (`api/gateway.rs`), generalized
//! from one breaker per backend to a named registry (`spec.md` §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through; failures accumulate toward `failure_threshold`.
    Closed,
    /// Requests fail fast without reaching the dependency.
    Open,
    /// A limited number of probe requests are admitted to test recovery.
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit '{0}' is open")]
    Open(String),
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CircuitStatistics {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub half_open_inflight: u32,
}

/// A single named breaker. `failures`/`successes` count toward the
/// threshold that matters for the *current* state only — closed counts
/// consecutive failures, half-open counts consecutive probe successes.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: RwLock<CircuitState>,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_inflight: AtomicU32,
    last_transition: RwLock<Instant>,
}

impl CircuitBreaker {
    fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            last_transition: RwLock::new(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Admit or reject a request for the current state, transitioning
    /// OPEN -> HALF_OPEN when the timeout has elapsed. Each admitted
    /// HALF_OPEN probe reserves one of `half_open_max_calls` slots; callers
    /// that are rejected here must not call `record_success`/`record_failure`.
    fn admit(&self) -> Result<(), CircuitError> {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.last_transition.read().elapsed() >= self.config.timeout {
                    self.transition_to(CircuitState::HalfOpen);
                    self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(CircuitError::Open(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let inflight = self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
                if inflight >= self.config.half_open_max_calls {
                    self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                    Err(CircuitError::Open(self.name.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                let successes = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, next: CircuitState) {
        *self.state.write() = next;
        *self.last_transition.write() = Instant::now();
        self.failures.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
        self.half_open_inflight.store(0, Ordering::SeqCst);
        tracing::warn!(circuit = %self.name, state = ?next, "circuit breaker transitioned");
    }

    fn reset(&self) {
        self.transition_to(CircuitState::Closed);
    }

    fn statistics(&self) -> CircuitStatistics {
        CircuitStatistics {
            name: self.name.clone(),
            state: self.state(),
            failures: self.failures.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            half_open_inflight: self.half_open_inflight.load(Ordering::SeqCst),
        }
    }

    /// Run `f` under this breaker: admits per current state, records the
    /// outcome, and passes the inner error through unchanged on success of
    /// admission. `is_failure` lets callers treat some `Ok`-shaped results
    /// (e.g. an upstream 4xx mapped to a non-error return) as failures too;
    /// pass `|_| false` when any `Ok` should count as a success.
    pub async fn call<T, E, F, Fut>(&self, is_failure: impl Fn(&Result<T, E>) -> bool, f: F) -> Result<T, CircuitOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().map_err(CircuitOutcome::Rejected)?;
        let result = f().await;
        if is_failure(&result) {
            self.record_failure();
        } else {
            self.record_success();
        }
        result.map_err(CircuitOutcome::Inner)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitOutcome<E> {
    #[error(transparent)]
    Rejected(#[from] CircuitError),
    #[error(transparent)]
    Inner(E),
}

/// Registry of named breakers, created lazily on first use with a shared
/// default config. The dispatcher registers one breaker per logical
/// upstream dependency (currently just `"mengla_upstream"`); admin routes
/// list and reset by name.
#[derive(Clone)]
pub struct CircuitManager {
    config: CircuitConfig,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitManager {
    pub fn new(config: CircuitConfig) -> Self {
        Self { config, breakers: Arc::new(DashMap::new()) }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config)))
            .clone()
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn all_statistics(&self) -> Vec<CircuitStatistics> {
        self.breakers.iter().map(|e| e.value().statistics()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitConfig {
        CircuitConfig { failure_threshold: 2, success_threshold: 2, timeout: Duration::from_millis(20), half_open_max_calls: 1 }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_and_rejects_fast() {
        let mgr = CircuitManager::new(fast_config());
        let cb = mgr.get("upstream");

        for _ in 0..2 {
            let _ = cb.call(|r: &Result<(), &str>| r.is_err(), || async { Err::<(), &str>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|r: &Result<(), &str>| r.is_err(), || async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(CircuitOutcome::Rejected(_))));
    }

    #[tokio::test]
    async fn half_open_probe_closes_circuit_on_success() {
        let mgr = CircuitManager::new(fast_config());
        let cb = mgr.get("upstream");

        for _ in 0..2 {
            let _ = cb.call(|r: &Result<(), &str>| r.is_err(), || async { Err::<(), &str>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(25)).await;

        for _ in 0..2 {
            let result = cb.call(|r: &Result<(), &str>| r.is_err(), || async { Ok::<(), &str>(()) }).await;
            assert!(result.is_ok());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn manual_reset_forces_closed() {
        let mgr = CircuitManager::new(fast_config());
        let cb = mgr.get("upstream");
        for _ in 0..2 {
            let _ = cb.call(|r: &Result<(), &str>| r.is_err(), || async { Err::<(), &str>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(mgr.reset("upstream"));
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
