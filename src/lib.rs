//! `mengla-collector` — a rate-limited, reliability-hardened orchestrator
//! sitting in front of a serial upstream managed-task service. It resolves
//! each `(action, cat_id, granularity, period_key)` request through a
//! three-tier cache, serializes and retries upstream calls behind a
//! circuit breaker, and drives a fixed cron/interval job table plus a
//! durable backfill queue.
//!
//! ## Modules
//!
//! - `config`: environment-driven startup configuration
//! - `db`: the Postgres-backed durable store
//! - `cache`: the three-tier (L1/L2/L3) read-through cache
//! - `dispatcher`: serialized, rendezvous-polled upstream execution
//! - `collector`: the per-identity-tuple orchestration entry point
//! - `resilience`: retry, circuit breaker, metrics, and alerting
//! - `scheduler`: the fixed cron/interval job table
//! - `queue`: the durable crawl-job worker
//! - `webhook`: the upstream's callback surface
//! - `admin`: the operator HTTP surface
//! - `app`: the shared dependency container

#![warn(clippy::all)]

pub mod admin;
pub mod app;
pub mod cache;
pub mod collector;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod period;
pub mod queue;
pub mod resilience;
pub mod scheduler;
pub mod webhook;

pub use app::AppState;
pub use config::Config;
pub use error::{AppError, AppResult};

/// Crate version, as reported in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as reported in startup logs.
pub const NAME: &str = env!("CARGO_PKG_NAME");
