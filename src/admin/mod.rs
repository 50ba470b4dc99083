//! The operator-facing HTTP surface: metrics, alerts, cache and circuit
//! introspection, scheduler control, manual backfills, and sync-task-log
//! management — every route `spec.md` §6 lists under "Admin HTTP".
//!
//! Grounded in the teacher's `api/handlers/admin.rs` route layout (plain
//! axum handlers over a shared state, one module per concern) and its
//! `api/middleware.rs` request-guard pattern, narrowed to the single
//! bearer-JWT gate in [`auth::require_admin`].

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::period::Granularity;

/// Builds the full admin router, with `auth::require_admin` wrapping every
/// route except `/admin/login` itself.
pub fn build(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let guarded = Router::new()
        .route("/admin/metrics", get(metrics))
        .route("/admin/metrics/latency", get(metrics_latency))
        .route("/admin/alerts", get(alerts_check))
        .route("/admin/alerts/history", get(alerts_history))
        .route("/admin/alerts/check", post(alerts_check))
        .route("/admin/alerts/silence", post(alerts_silence))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/warmup", post(cache_warmup))
        .route("/admin/cache/clear-l1", post(cache_clear_l1))
        .route("/admin/circuit-breakers", get(circuit_breakers))
        .route("/admin/circuit-breakers/reset", post(circuit_breakers_reset))
        .route("/admin/scheduler/status", get(scheduler_status))
        .route("/admin/scheduler/pause", post(scheduler_pause))
        .route("/admin/scheduler/resume", post(scheduler_resume))
        .route("/admin/tasks/cancel-all", post(tasks_cancel_all))
        .route("/admin/data/purge", post(data_purge))
        .route("/admin/mengla/enqueue-full-crawl", post(enqueue_full_crawl))
        .route("/admin/collect-health", get(collect_health))
        .route("/admin/sync-tasks", get(sync_tasks_today))
        .route("/admin/sync-tasks/:id", get(sync_task_detail))
        .route("/admin/sync-tasks/:id", delete(sync_task_delete))
        .route("/admin/sync-tasks/:id/cancel", post(sync_task_cancel))
        .route_layer(middleware::from_fn_with_state(state, auth::require_admin));

    Router::new().route("/admin/login", post(auth::login)).merge(guarded)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.metrics.snapshot()).unwrap())
}

async fn metrics_latency(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.metrics.latency_percentiles()).unwrap())
}

async fn alerts_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let statuses = state.alerts.check(&state.metrics.snapshot());
    Json(json!({ "rules": statuses }))
}

async fn alerts_history(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "history": state.alerts.history() }))
}

#[derive(Deserialize)]
struct SilenceRequest {
    rule_name: String,
    duration_minutes: u64,
}

async fn alerts_silence(State(state): State<Arc<AppState>>, Json(req): Json<SilenceRequest>) -> Response {
    let silenced = state.alerts.silence(&req.rule_name, Duration::from_secs(req.duration_minutes * 60));
    if silenced {
        Json(json!({ "status": "ok" })).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown_rule" }))).into_response()
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.cache.get_stats()).unwrap())
}

#[derive(Deserialize)]
struct WarmupQuery {
    action: Option<String>,
    cat_id: Option<String>,
    granularity: Option<String>,
    #[serde(default = "default_warmup_limit")]
    limit: i64,
}

fn default_warmup_limit() -> i64 {
    500
}

async fn cache_warmup(State(state): State<Arc<AppState>>, Query(q): Query<WarmupQuery>) -> Json<serde_json::Value> {
    let granularity = q.granularity.as_deref().and_then(parse_granularity);
    let (populated, errors) = state.cache.warmup(q.action.as_deref(), q.cat_id.as_deref(), granularity, q.limit).await;
    Json(json!({ "populated": populated, "errors": errors }))
}

async fn cache_clear_l1(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.cache.clear_l1().await;
    Json(json!({ "status": "ok" }))
}

async fn circuit_breakers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "breakers": state.circuit.all_statistics() }))
}

#[derive(Deserialize)]
struct CircuitResetQuery {
    name: Option<String>,
}

async fn circuit_breakers_reset(State(state): State<Arc<AppState>>, Query(q): Query<CircuitResetQuery>) -> Json<serde_json::Value> {
    match q.name {
        Some(name) => {
            let reset = state.circuit.reset(&name);
            Json(json!({ "reset": reset }))
        }
        None => {
            state.circuit.reset_all();
            Json(json!({ "reset": "all" }))
        }
    }
}

async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.scheduler.status()).unwrap())
}

async fn scheduler_pause(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.scheduler.pause();
    Json(json!({ "status": "paused" }))
}

async fn scheduler_resume(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.scheduler.resume();
    Json(json!({ "status": "resumed" }))
}

async fn tasks_cancel_all(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.cancel_all_running().await {
        Ok(n) => Json(json!({ "cancelled": n })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct PurgeRequest {
    confirm: bool,
    targets: Vec<String>,
}

async fn data_purge(State(state): State<Arc<AppState>>, Json(req): Json<PurgeRequest>) -> Response {
    if !req.confirm {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "confirm must be true" }))).into_response();
    }

    let mut result = serde_json::Map::new();
    for target in &req.targets {
        match target.as_str() {
            "postgres" => match state.db.purge_mengla_data().await {
                Ok(n) => {
                    result.insert("postgres".into(), json!(n));
                }
                Err(err) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response();
                }
            },
            "redis" => {
                let purged = purge_redis_prefix(&state, "mengla:").await;
                result.insert("redis".into(), json!(purged));
            }
            "l1" => {
                state.cache.clear_l1().await;
                result.insert("l1".into(), json!(true));
            }
            other => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("unknown purge target '{other}'") }))).into_response();
            }
        }
    }

    Json(json!({ "status": "ok", "purged": result })).into_response()
}

async fn purge_redis_prefix(state: &AppState, prefix: &str) -> u64 {
    let mut conn = state.redis.clone();
    let pattern = format!("{prefix}*");
    let mut cursor: u64 = 0;
    let mut deleted = 0u64;
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(200)
            .query_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "redis purge scan failed");
                break;
            }
        };
        if !keys.is_empty() {
            if let Ok(n) = conn.del::<_, u64>(&keys).await {
                deleted += n;
            }
        }
        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }
    deleted
}

#[derive(Deserialize)]
struct EnqueueFullCrawlRequest {
    #[serde(rename = "catId")]
    cat_id: String,
    #[serde(rename = "startDate")]
    start_date: String,
    #[serde(rename = "endDate")]
    end_date: String,
    granularities: Option<Vec<String>>,
    actions: Option<Vec<String>>,
}

async fn enqueue_full_crawl(State(state): State<Arc<AppState>>, Json(req): Json<EnqueueFullCrawlRequest>) -> Response {
    let granularities: Vec<Granularity> = req
        .granularities
        .unwrap_or_else(|| vec!["day".into(), "month".into(), "quarter".into(), "year".into()])
        .iter()
        .filter_map(|g| parse_granularity(g))
        .collect();

    let actions = req.actions.unwrap_or_else(|| {
        vec!["high".into(), "hot".into(), "chance".into(), "industry_view_v2".into(), "industry_trend_range".into()]
    });

    match crate::queue::enqueue_full_crawl(&state.db, &req.cat_id, &req.start_date, &req.end_date, &granularities, &actions).await {
        Ok(job_id) => Json(json!({ "jobId": job_id })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct CollectHealthQuery {
    date: Option<String>,
}

async fn collect_health(State(state): State<Arc<AppState>>, Query(q): Query<CollectHealthQuery>) -> Json<serde_json::Value> {
    let date = q.date.unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    let daily = state.metrics.daily_summaries();
    let summary = daily
        .iter()
        .find(|(d, _)| d.format("%Y-%m-%d").to_string() == date)
        .map(|(_, s)| s.clone());
    Json(json!({ "date": date, "summary": summary }))
}

async fn sync_tasks_today(State(state): State<Arc<AppState>>) -> Response {
    match state.db.todays_sync_task_logs().await {
        Ok(logs) => Json(json!({ "tasks": logs })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn sync_task_detail(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.db.get_sync_task_log(id).await {
        Ok(Some(log)) => Json(log).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn sync_task_cancel(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.scheduler.cancel(id).await {
        Ok(cancelled) => Json(json!({ "cancelled": cancelled })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct DeleteSyncTaskQuery {
    #[serde(default)]
    with_data: bool,
}

async fn sync_task_delete(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>, Query(q): Query<DeleteSyncTaskQuery>) -> Response {
    if q.with_data {
        if let Err(err) = state.db.purge_mengla_data().await {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response();
        }
    }
    match state.db.delete_sync_task_log(id).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

fn parse_granularity(s: &str) -> Option<Granularity> {
    match s {
        "day" => Some(Granularity::Day),
        "month" => Some(Granularity::Month),
        "quarter" => Some(Granularity::Quarter),
        "year" => Some(Granularity::Year),
        _ => None,
    }
}
