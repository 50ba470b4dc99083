//! Startup configuration, loaded once from the environment.

use std::time::Duration;

use clap::Parser;
use zeroize::Zeroize;

/// Every environment key the collection fabric recognizes.
///
/// `clap`'s `env` feature loads each field directly from its variable; a
/// missing required field fails the process at startup with a readable
/// message rather than a panic deep inside a handler.
#[derive(Parser, Debug, Clone)]
#[command(name = "mengla-collector", version)]
pub struct Config {
    /// Postgres connection string. Stands in for the original `MONGO_URI`;
    /// the database name lives in the URL itself so `MONGO_DB` is dropped.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Redis connection string for L2 cache, rendezvous, and counters.
    #[arg(long, env = "REDIS_URI")]
    pub redis_uri: String,

    /// Base URL of the upstream managed-task service.
    #[arg(long, env = "COLLECT_SERVICE_URL")]
    pub collect_service_url: String,

    /// Bearer token used against the upstream managed-task service.
    #[arg(long, env = "COLLECT_SERVICE_API_KEY")]
    pub collect_service_api_key: String,

    /// This process's own externally-reachable base URL, used to derive the
    /// webhook callback URL when `MENGLA_WEBHOOK_URL` is unset.
    #[arg(long, env = "APP_BASEURL")]
    pub app_baseurl: String,

    /// Explicit webhook callback URL override.
    #[arg(long, env = "MENGLA_WEBHOOK_URL")]
    pub mengla_webhook_url: Option<String>,

    /// Deadline for a single upstream execute + rendezvous, in seconds.
    #[arg(long, env = "MENGLA_TIMEOUT_SECONDS", default_value_t = 300)]
    pub mengla_timeout_seconds: u64,

    /// Upstream concurrency cap; the upstream is strictly serial by default.
    #[arg(long, env = "MAX_INFLIGHT_REQUESTS", default_value_t = 1)]
    pub max_inflight_requests: usize,

    /// Per-category worker pool size for scheduled non-trend batches.
    #[arg(long, env = "MAX_CONCURRENT_TASKS", default_value_t = 5)]
    pub max_concurrent_tasks: usize,

    /// L1 in-process cache capacity.
    #[arg(long, env = "L1_CACHE_MAX_SIZE", default_value_t = 1000)]
    pub l1_cache_max_size: u64,

    /// L1 in-process cache per-entry TTL, seconds.
    #[arg(long, env = "L1_CACHE_TTL", default_value_t = 300)]
    pub l1_cache_ttl: u64,

    /// Retry attempts before a call is handed to the circuit breaker as a failure.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    /// Retry base delay, seconds.
    #[arg(long, env = "RETRY_BASE_DELAY", default_value_t = 1)]
    pub retry_base_delay: u64,

    /// Retry max delay, seconds.
    #[arg(long, env = "RETRY_MAX_DELAY", default_value_t = 60)]
    pub retry_max_delay: u64,

    /// Consecutive failures in CLOSED before the breaker opens.
    #[arg(long, env = "CB_FAILURE_THRESHOLD", default_value_t = 5)]
    pub cb_failure_threshold: u32,

    /// Consecutive successes in HALF_OPEN before the breaker closes.
    #[arg(long, env = "CB_SUCCESS_THRESHOLD", default_value_t = 3)]
    pub cb_success_threshold: u32,

    /// Seconds an OPEN breaker waits before admitting a probe.
    #[arg(long, env = "CB_TIMEOUT", default_value_t = 60)]
    pub cb_timeout: u64,

    /// Probes admitted per HALF_OPEN window.
    #[arg(long, env = "CB_HALF_OPEN_CALLS", default_value_t = 3)]
    pub cb_half_open_calls: u32,

    /// Interval-job pacing for `crawl_queue`, seconds.
    #[arg(long, env = "COLLECT_INTERVAL_SECONDS", default_value_t = 240)]
    pub collect_interval_seconds: u64,

    /// Minimum pacing jitter between successive non-trend dispatches inside
    /// a period-collect pass, seconds.
    #[arg(long, env = "INTER_REQUEST_JITTER_MIN_SECONDS", default_value_t = 3)]
    pub inter_request_jitter_min_seconds: u64,

    /// Maximum pacing jitter between successive non-trend dispatches,
    /// seconds.
    #[arg(long, env = "INTER_REQUEST_JITTER_MAX_SECONDS", default_value_t = 9)]
    pub inter_request_jitter_max_seconds: u64,

    /// HMAC secret used by the admin JWT guard.
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Bootstrap admin username, used only by `POST /admin/login`.
    #[arg(long, env = "ADMIN_USERNAME")]
    pub admin_username: String,

    /// Bootstrap admin password, used only by `POST /admin/login`.
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Explicit admin-panel enable/disable; when unset, defaults to enabled
    /// outside `ENV=production` and disabled inside it.
    #[arg(long, env = "ENABLE_PANEL_ADMIN")]
    pub enable_panel_admin: Option<bool>,

    /// Deployment environment name (`production`, `development`, ...).
    #[arg(long, env = "ENV", default_value = "development")]
    pub env: String,

    /// Shared secret for webhook HMAC verification. Absent means "skip
    /// verification" — an explicit, logged, dev-only fallback.
    #[arg(long, env = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Comma-separated list of origins allowed by CORS.
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = "")]
    pub cors_allowed_origins: String,

    /// Comma-separated top-level category ids the periodic jobs sweep.
    /// Stands in for the catalogue service (out of scope per `spec.md` §1):
    /// that service owns the authoritative list, this process only needs
    /// the ids to drive `run_period_collect`.
    #[arg(long, env = "COLLECT_CATEGORIES", default_value = "")]
    pub collect_categories: String,

    #[arg(long, env = "CRON_DAILY_COLLECT", default_value = "0 4 * * *")]
    pub cron_daily_collect: String,

    #[arg(long, env = "CRON_MONTHLY_COLLECT", default_value = "0 5 3 * *")]
    pub cron_monthly_collect: String,

    #[arg(long, env = "CRON_QUARTERLY_COLLECT", default_value = "0 6 10 1,4,7,10 *")]
    pub cron_quarterly_collect: String,

    #[arg(long, env = "CRON_YEARLY_COLLECT", default_value = "0 7 20 1 *")]
    pub cron_yearly_collect: String,

    #[arg(long, env = "CRON_BACKFILL_CHECK", default_value = "0 */4 * * *")]
    pub cron_backfill_check: String,

    #[arg(long, env = "CRON_GC_EXPIRED_DOCUMENTS", default_value = "0 */1 * * *")]
    pub cron_gc_expired_documents: String,
}

/// Wipes every secret-bearing field's backing memory when the last owner of
/// a `Config` (or a clone of it) goes out of scope.
impl Drop for Config {
    fn drop(&mut self) {
        self.collect_service_api_key.zeroize();
        self.jwt_secret.zeroize();
        self.admin_password.zeroize();
        self.webhook_secret.zeroize();
    }
}

impl Config {
    /// Parse configuration from the process environment, exiting on failure.
    pub fn load() -> Self {
        Config::parse()
    }

    /// Whether the admin panel should be reachable at all, per
    /// `ENABLE_PANEL_ADMIN` / `ENV` (mirrors the upstream's dev-convenient,
    /// prod-safe default).
    pub fn panel_admin_enabled(&self) -> bool {
        match self.enable_panel_admin {
            Some(v) => v,
            None => self.env.to_lowercase() != "production",
        }
    }

    pub fn mengla_timeout(&self) -> Duration {
        Duration::from_secs(self.mengla_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay)
    }

    pub fn cb_timeout(&self) -> Duration {
        Duration::from_secs(self.cb_timeout)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `(min, max)` seconds for the inter-request pacing jitter, clamped so
    /// max never falls below min regardless of misconfiguration.
    pub fn inter_request_jitter_range(&self) -> (u64, u64) {
        let min = self.inter_request_jitter_min_seconds;
        let max = self.inter_request_jitter_max_seconds.max(min);
        (min, max)
    }

    pub fn categories(&self) -> Vec<String> {
        self.collect_categories
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
