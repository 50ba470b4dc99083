//! The dependency container every handler and background task shares —
//! grounded in the teacher's `AppState`/`saas_app.rs` wiring pattern:
//! construct every concrete backend once at startup, then pass a single
//! cheaply-cloneable handle around instead of threading a dozen
//! constructor arguments through every layer.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::cache::CacheManager;
use crate::collector::Collector;
use crate::config::Config;
use crate::db::pool::{Database, DatabaseConfig};
use crate::dispatcher::client::{ManagedTaskClient, ReqwestManagedTaskClient};
use crate::dispatcher::Dispatcher;
use crate::resilience::{AlertEngine, CircuitConfig, CircuitManager, LogSink, MetricsCollector, RetryPolicy};
use crate::scheduler::AppScheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub redis: ConnectionManager,
    pub cache: CacheManager,
    pub collector: Arc<Collector>,
    pub circuit: CircuitManager,
    pub metrics: MetricsCollector,
    pub alerts: Arc<AlertEngine>,
    pub scheduler: Arc<AppScheduler>,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let db = Database::connect(DatabaseConfig::from_url(config.database_url.clone())).await?;
        db.migrate().await?;

        let redis_client = redis::Client::open(config.redis_uri.clone())?;
        let redis: ConnectionManager = ConnectionManager::new(redis_client).await?;

        let cache = CacheManager::new(config.l1_cache_max_size, Duration::from_secs(config.l1_cache_ttl), redis.clone(), db.clone());

        let client: Arc<dyn ManagedTaskClient> =
            Arc::new(ReqwestManagedTaskClient::new(config.collect_service_url.clone(), config.collect_service_api_key.clone()));
        let webhook_url = crate::dispatcher::client::resolve_webhook_url(config.mengla_webhook_url.as_deref(), &config.app_baseurl);
        let dispatcher = Arc::new(Dispatcher::new(
            client,
            redis.clone(),
            config.max_inflight_requests,
            Duration::from_secs(1),
            webhook_url,
            config.mengla_timeout(),
        ));

        let circuit = CircuitManager::new(CircuitConfig {
            failure_threshold: config.cb_failure_threshold,
            success_threshold: config.cb_success_threshold,
            timeout: config.cb_timeout(),
            half_open_max_calls: config.cb_half_open_calls,
        });
        let metrics = MetricsCollector::new();
        let retry_policy = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            jitter: true,
        };

        let collector = Arc::new(Collector::new(cache.clone(), db.clone(), dispatcher, circuit.clone(), metrics.clone(), retry_policy));
        let alerts = Arc::new(AlertEngine::new(Arc::new(LogSink)));
        let scheduler = Arc::new(AppScheduler::new(db.clone(), collector.clone(), redis.clone(), metrics.clone(), &config));

        Ok(Self { config: Arc::new(config), db, redis, cache, collector, circuit, metrics, alerts, scheduler })
    }
}
