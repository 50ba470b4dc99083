//! The upstream dispatcher: enforces the minimum-interval/max-inflight
//! budget, looks up the managed-task id, executes, and rendezvous-polls
//! Redis for the webhook's result.

pub mod client;
pub mod params;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::error::{AppError, AppResult};
use crate::payload::Action;
use crate::period::Granularity;

pub use client::{ManagedTaskClient, ReqwestManagedTaskClient};

const HEARTBEAT_STATUSES: &[&str] = &["running", "sync", "pending", "queued"];

/// Point-in-time pressure counters surfaced by `GET /admin/metrics`.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PressureStats {
    pub max_inflight: usize,
    pub inflight: usize,
    pub waiting: usize,
    pub total_sent: u64,
    pub total_completed: u64,
    pub total_timeout: u64,
    pub total_error: u64,
}

struct Counters {
    waiting: AtomicU64,
    total_sent: AtomicU64,
    total_completed: AtomicU64,
    total_timeout: AtomicU64,
    total_error: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            waiting: 0.into(),
            total_sent: 0.into(),
            total_completed: 0.into(),
            total_timeout: 0.into(),
            total_error: 0.into(),
        }
    }
}

/// A single fetch request's identity-derived fields plus optional caller
/// extras, translated into the upstream's parameter shape.
pub struct FetchRequest<'a> {
    pub action: Action,
    pub cat_id: &'a str,
    pub granularity: Granularity,
    pub period_key: &'a str,
    pub extra: Option<&'a Value>,
}

/// Enforces §4.2's global minimum interval and max-inflight budget, then
/// executes an upstream call and waits on the Redis rendezvous key.
pub struct Dispatcher {
    client: Arc<dyn ManagedTaskClient>,
    redis: ConnectionManager,
    semaphore: Arc<Semaphore>,
    max_inflight: usize,
    min_interval: Duration,
    last_execute: Mutex<Instant>,
    webhook_url: String,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ManagedTaskClient>,
        redis: ConnectionManager,
        max_inflight: usize,
        min_interval: Duration,
        webhook_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            redis,
            semaphore: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
            min_interval,
            last_execute: Mutex::new(Instant::now() - min_interval),
            webhook_url,
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn pressure(&self) -> PressureStats {
        use Ordering::Relaxed;
        PressureStats {
            max_inflight: self.max_inflight,
            inflight: self.max_inflight - self.semaphore.available_permits(),
            waiting: self.counters.waiting.load(Relaxed) as usize,
            total_sent: self.counters.total_sent.load(Relaxed),
            total_completed: self.counters.total_completed.load(Relaxed),
            total_timeout: self.counters.total_timeout.load(Relaxed),
            total_error: self.counters.total_error.load(Relaxed),
        }
    }

    /// Enforce minimum interval, acquire the in-flight permit, execute, and
    /// rendezvous. This is the single call-site the resilience layer wraps
    /// in retry + circuit breaker.
    pub async fn dispatch(&self, req: &FetchRequest<'_>) -> AppResult<Value> {
        self.counters.waiting.fetch_add(1, Ordering::Relaxed);
        let _permit = self.semaphore.acquire().await.map_err(|e| AppError::Internal(e.into()))?;
        self.counters.waiting.fetch_sub(1, Ordering::Relaxed);

        self.wait_for_min_interval().await;

        let task_id = self.client.find_managed_task_id().await?;
        let parameters = params::translate(req);
        self.counters.total_sent.fetch_add(1, Ordering::Relaxed);

        let execution_id = match self.client.execute(&task_id, &parameters, &self.webhook_url).await {
            Ok(id) => id,
            Err(err) => {
                self.counters.total_error.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        match self.rendezvous(&execution_id).await {
            Ok(value) => {
                self.counters.total_completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(AppError::UpstreamTimeout(msg)) => {
                self.counters.total_timeout.fetch_add(1, Ordering::Relaxed);
                Err(AppError::UpstreamTimeout(msg))
            }
            Err(err) => {
                self.counters.total_error.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn wait_for_min_interval(&self) {
        let mut last = self.last_execute.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            tokio::time::sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }

    /// Poll `mengla:exec:<execution_id>` with progressive backoff: 100ms for
    /// the first 30s, then 1s, then 5s, then 10s, until `self.timeout`
    /// elapses. Heartbeat payloads are deleted and skipped; a real payload
    /// is deleted and returned.
    async fn rendezvous(&self, execution_id: &str) -> AppResult<Value> {
        let key = format!("mengla:exec:{execution_id}");
        let deadline = Instant::now() + self.timeout;
        let started = Instant::now();
        let mut conn = self.redis.clone();

        loop {
            if Instant::now() >= deadline {
                let _: Result<(), _> = conn.del(&key).await;
                return Err(AppError::UpstreamTimeout(format!(
                    "no webhook result for execution {execution_id} within {:?}",
                    self.timeout
                )));
            }

            if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                    let status = value.get("status").and_then(Value::as_str).map(str::to_lowercase);
                    if let Some(status) = status {
                        if HEARTBEAT_STATUSES.contains(&status.as_str()) {
                            let _: Result<(), _> = conn.del(&key).await;
                            tokio::time::sleep(poll_interval(started.elapsed())).await;
                            continue;
                        }
                    }
                    let _: Result<(), _> = conn.del(&key).await;
                    return Ok(value);
                }
            }

            tokio::time::sleep(poll_interval(started.elapsed())).await;
        }
    }
}

fn poll_interval(elapsed: Duration) -> Duration {
    if elapsed < Duration::from_secs(30) {
        Duration::from_millis(100)
    } else if elapsed < Duration::from_secs(60) {
        Duration::from_secs(1)
    } else if elapsed < Duration::from_secs(120) {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(10)
    }
}
