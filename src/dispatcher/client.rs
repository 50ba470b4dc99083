//! The upstream managed-task HTTP client, behind a trait seam so tests can
//! substitute a fake with no network — grounded in the teacher's
//! `JobExecutor`/`TaskHandler` async-trait pattern (`scheduling/mod.rs`),
//! generalized from "execute one scheduled job" to "execute one upstream
//! managed task and return its execution id".

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, AppResult};

const MANAGED_TASK_NAME: &str = "萌啦数据采集";

#[async_trait]
pub trait ManagedTaskClient: Send + Sync {
    /// `GET {base}/api/managed-tasks?page=1&limit=100`, returning the id of
    /// the task named [`MANAGED_TASK_NAME`]. Not cached per `spec.md` §4.2.
    async fn find_managed_task_id(&self) -> AppResult<String>;

    /// `POST {base}/api/managed-tasks/{task_id}/execute`, returning the
    /// upstream's `executionId`.
    async fn execute(&self, task_id: &str, parameters: &Value, webhook_url: &str) -> AppResult<String>;
}

pub struct ReqwestManagedTaskClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ReqwestManagedTaskClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self { http, base_url, api_key }
    }
}

#[async_trait]
impl ManagedTaskClient for ReqwestManagedTaskClient {
    async fn find_managed_task_id(&self) -> AppResult<String> {
        let url = format!("{}/api/managed-tasks?page=1&limit=100", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| map_reqwest_err(e))?;

        if !resp.status().is_success() {
            return Err(AppError::UpstreamError(format!("managed-tasks list returned {}", resp.status())));
        }

        let body: Value = resp.json().await.map_err(|e| AppError::UpstreamError(e.to_string()))?;
        let tasks = body
            .get("data")
            .and_then(|d| d.get("tasks"))
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::UpstreamError("malformed managed-tasks response".into()))?;

        tasks
            .iter()
            .find(|t| t.get("name").and_then(Value::as_str) == Some(MANAGED_TASK_NAME))
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::UpstreamError(format!("no managed task named {MANAGED_TASK_NAME}")))
    }

    async fn execute(&self, task_id: &str, parameters: &Value, webhook_url: &str) -> AppResult<String> {
        let url = format!("{}/api/managed-tasks/{task_id}/execute", self.base_url);
        let body = serde_json::json!({ "parameters": parameters, "webhookUrl": webhook_url });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        if !resp.status().is_success() {
            return Err(AppError::UpstreamError(format!("execute returned {}", resp.status())));
        }

        let body: Value = resp.json().await.map_err(|e| AppError::UpstreamError(e.to_string()))?;
        body.get("data")
            .and_then(|d| d.get("executionId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::UpstreamError("execute response missing executionId".into()))
    }
}

fn map_reqwest_err(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::UpstreamTimeout(err.to_string())
    } else if err.is_connect() {
        AppError::UpstreamUnavailable(err.to_string())
    } else {
        AppError::UpstreamError(err.to_string())
    }
}

/// Resolve the webhook callback URL: prefer an explicit override, otherwise
/// derive from the app's own base URL.
pub fn resolve_webhook_url(explicit: Option<&str>, app_baseurl: &str) -> String {
    explicit
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/api/webhook/mengla-notify", app_baseurl.trim_end_matches('/')))
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// An in-process fake upstream used across the resilience and collector
    /// test suites: no network, deterministic execution ids, and a
    /// configurable failure/latency script.
    pub struct FakeManagedTaskClient {
        pub task_id: String,
        pub execute_calls: AtomicUsize,
        pub fail_next: Mutex<usize>,
    }

    impl FakeManagedTaskClient {
        pub fn new() -> Self {
            Self { task_id: "task-1".into(), execute_calls: AtomicUsize::new(0), fail_next: Mutex::new(0) }
        }

        pub fn calls(&self) -> usize {
            self.execute_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManagedTaskClient for FakeManagedTaskClient {
        async fn find_managed_task_id(&self) -> AppResult<String> {
            Ok(self.task_id.clone())
        }

        async fn execute(&self, _task_id: &str, _parameters: &Value, _webhook_url: &str) -> AppResult<String> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(AppError::UpstreamError("simulated failure".into()));
            }
            Ok(format!("exec-{}", self.execute_calls.load(Ordering::SeqCst)))
        }
    }
}
