//! The domain collector: the `query()` entry point that orchestrates the
//! cache manager and dispatcher, deduplicates concurrent identical fetches,
//! and applies the persistence policy (`spec.md` §4.1 step 3, §4.2 steps
//! 1-5).
//!
//! In-flight dedup is grounded in the teacher's DataLoader batch queue
//! (`enterprise/graphql/dataloader.rs`), which fans one batch's result out
//! to every caller waiting on it via a channel. Generalized here from a
//! oneshot-per-batch-tick to a broadcast-per-identity-tuple: any number of
//! callers may race on the same `(action, cat_id, granularity, period_key)`
//! concurrently and must all observe the same single upstream call.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cache::{l3_retention, CacheManager};
use crate::db::Database;
use crate::dispatcher::{Dispatcher, FetchRequest};
use crate::error::{AppError, AppResult};
use crate::payload::{self, Action};
use crate::period::{self, Granularity};
use crate::resilience::{retry_async, CircuitManager, CircuitOutcome, MetricsCollector, RetryPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub data: Value,
    pub source: &'static str,
    pub partial: Option<PartialInfo>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartialInfo {
    pub requested: usize,
    pub found: usize,
}

#[derive(Clone)]
struct FetchOutcome {
    data: Value,
}

/// What a leader broadcasts to its followers. Errors cross the channel as
/// strings since `AppError` isn't `Clone` (its `sqlx`/`redis` variants
/// aren't); followers reconstruct a generic upstream error from the text.
type FetchResult = Result<FetchOutcome, String>;

/// Consecutive empty-upstream-result count past which a streak gets logged.
const EMPTY_STREAK_WARN_THRESHOLD: i64 = 5;

enum Role {
    Leader(broadcast::Sender<FetchResult>),
    Follower(broadcast::Sender<FetchResult>),
}

/// Orchestrates every identity-tuple read: cache read-through, trend
/// read-through and splitting, upstream dispatch behind retry + circuit
/// breaker, and the persistence policy.
pub struct Collector {
    cache: CacheManager,
    db: Database,
    dispatcher: Arc<Dispatcher>,
    circuit: CircuitManager,
    metrics: MetricsCollector,
    retry_policy: RetryPolicy,
    inflight: DashMap<String, broadcast::Sender<FetchResult>>,
}

impl Collector {
    pub fn new(
        cache: CacheManager,
        db: Database,
        dispatcher: Arc<Dispatcher>,
        circuit: CircuitManager,
        metrics: MetricsCollector,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self { cache, db, dispatcher, circuit, metrics, retry_policy, inflight: DashMap::new() }
    }

    /// `query(action, cat_id, granularity, timest, extra?, use_cache=true)`.
    pub async fn query(
        &self,
        action_raw: &str,
        cat_id: &str,
        granularity_raw: Option<&str>,
        timest: &str,
        extra: Option<&Value>,
        use_cache: bool,
    ) -> AppResult<QueryOutcome> {
        let action =
            Action::parse(action_raw).ok_or_else(|| AppError::Validation(format!("unknown action '{action_raw}'")))?;
        let granularity = Granularity::normalize(granularity_raw);

        if action.is_trend() {
            return self.query_trend(action, cat_id, granularity, timest, extra).await;
        }

        let period_key = period::timest_to_period_key(granularity, timest);
        let params_hash = payload::params_hash(extra);

        if use_cache {
            let (hit, source) = self.cache.get(action.as_str(), cat_id, granularity, &period_key, params_hash.as_deref()).await;
            if let Some(data) = hit {
                self.metrics.record_cache_hit();
                return Ok(QueryOutcome { data, source: source.as_str(), partial: None });
            }
            self.metrics.record_cache_miss();
        }

        let outcome = self.fetch_with_dedup(action, cat_id, granularity, &period_key, extra).await?;
        Ok(QueryOutcome { data: outcome.data, source: "fresh", partial: None })
    }

    /// Trend reads are never served by L1/L2 — the identity space is per
    /// point, not per range (`spec.md` §4.1). Reads L3 for every period key
    /// the range touches; if nothing is found at all, fetches the whole
    /// range from upstream and splits it into per-point documents.
    async fn query_trend(
        &self,
        action: Action,
        cat_id: &str,
        granularity: Granularity,
        timest: &str,
        extra: Option<&Value>,
    ) -> AppResult<QueryOutcome> {
        let (start, end) = extra
            .and_then(|e| {
                let s = e.get("starRange").and_then(Value::as_str)?;
                let e2 = e.get("endRange").and_then(Value::as_str)?;
                Some((s.to_string(), e2.to_string()))
            })
            .unwrap_or_else(|| period::period_to_date_range(granularity, timest));

        let keys = period::period_keys_in_range(granularity, &start, &end);
        let requested = keys.len();

        let rows = self.db.get_mengla_data_for_keys(action.as_str(), cat_id, granularity, &keys, None).await?;
        let found = rows.len();

        if found > 0 {
            let mut points: Vec<Value> = rows
                .iter()
                .flat_map(|r| {
                    r.data
                        .get("industryTrendRange")
                        .and_then(|v| v.get("data"))
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            points.sort_by(|a, b| {
                let ta = a.get("timest").and_then(Value::as_str).unwrap_or_default();
                let tb = b.get("timest").and_then(Value::as_str).unwrap_or_default();
                ta.cmp(tb)
            });

            let merged = serde_json::json!({ "industryTrendRange": { "data": points } });
            let partial = (found < requested).then_some(PartialInfo { requested, found });
            return Ok(QueryOutcome { data: merged, source: "mongo", partial });
        }

        let period_key = period::timest_to_period_key(granularity, timest);
        let req = FetchRequest { action, cat_id, granularity, period_key: &period_key, extra };
        let outcome = self.dispatch_through_resilience(&req).await?;
        self.persist_trend_points(action, cat_id, granularity, &outcome.data).await;
        Ok(QueryOutcome { data: outcome.data, source: "fresh", partial: None })
    }

    /// Join an in-flight fetch for this identity tuple, or become its
    /// leader. `request_key` deliberately excludes `extra` (`spec.md` §4.2
    /// step 4): concurrent callers differing only in extra params still
    /// collapse onto one upstream call.
    async fn fetch_with_dedup(
        &self,
        action: Action,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        extra: Option<&Value>,
    ) -> AppResult<FetchOutcome> {
        let request_key = format!("{}:{}:{}:{}", action.as_str(), cat_id, granularity.as_str(), period_key);

        loop {
            let role = match self.inflight.entry(request_key.clone()) {
                Entry::Occupied(occ) => Role::Follower(occ.get().clone()),
                Entry::Vacant(vac) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vac.insert(tx.clone());
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Follower(sender) => {
                    let mut receiver = sender.subscribe();
                    match receiver.recv().await {
                        Ok(Ok(outcome)) => return Ok(outcome),
                        Ok(Err(msg)) => return Err(AppError::UpstreamError(msg)),
                        // Leader dropped the sender before broadcasting (panic
                        // or task cancellation) — retry as a fresh leader.
                        Err(_) => continue,
                    }
                }
                Role::Leader(tx) => {
                    let result = self.run_leader(action, cat_id, granularity, period_key, extra).await;
                    let payload: FetchResult = result.as_ref().map(FetchOutcome::clone).map_err(ToString::to_string);
                    let _ = tx.send(payload);
                    // Remove the entry only if it's still ours — a newer
                    // generation may have already replaced it.
                    self.inflight.remove_if(&request_key, |_, v| v.same_channel(&tx));
                    return result;
                }
            }
        }
    }

    async fn run_leader(
        &self,
        action: Action,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        extra: Option<&Value>,
    ) -> AppResult<FetchOutcome> {
        let fetch_started_at = Utc::now();
        let started = Instant::now();
        let req = FetchRequest { action, cat_id, granularity, period_key, extra };
        let outcome = self.dispatch_through_resilience(&req).await?;
        let collect_duration_ms = started.elapsed().as_millis() as i64;
        self.persist_non_trend(action, cat_id, granularity, period_key, &outcome, fetch_started_at, extra, collect_duration_ms)
            .await;
        Ok(outcome)
    }

    /// Run one dispatch through retry + the named circuit breaker, then
    /// unwrap and empty-check the result.
    async fn dispatch_through_resilience(&self, req: &FetchRequest<'_>) -> AppResult<FetchOutcome> {
        let breaker = self.circuit.get("mengla_upstream");
        let started = Instant::now();

        let retry_result = retry_async(
            self.retry_policy,
            |err: &AppError| {
                matches!(err, AppError::UpstreamUnavailable(_) | AppError::UpstreamTimeout(_) | AppError::UpstreamError(_))
            },
            |attempt, err| tracing::warn!(attempt, %err, action = req.action.as_str(), "retrying upstream fetch"),
            || async {
                breaker
                    .call(|r: &AppResult<Value>| r.is_err(), || self.dispatcher.dispatch(req))
                    .await
                    .map_err(|outcome| match outcome {
                        CircuitOutcome::Rejected(_) => AppError::CircuitOpen("mengla_upstream".into()),
                        CircuitOutcome::Inner(err) => err,
                    })
            },
        )
        .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let raw = match retry_result {
            Ok(v) => v,
            Err(err) => {
                self.metrics.record_outcome(req.action.as_str(), "fresh", false, latency_ms);
                return Err(err);
            }
        };

        let envelope = payload::unwrap_envelope(req.action, &raw)
            .ok_or_else(|| AppError::UpstreamError("response missing expected envelope".into()))?;

        match payload::check_not_empty(req.action, &envelope) {
            Ok(data) => {
                self.metrics.record_outcome(req.action.as_str(), "fresh", true, latency_ms);
                self.cache.reset_empty_streak(req.action.as_str(), req.cat_id).await;
                Ok(FetchOutcome { data })
            }
            Err(reason) => {
                self.metrics.record_outcome(req.action.as_str(), "fresh", false, latency_ms);
                let streak = self.cache.record_empty_result(req.action.as_str(), req.cat_id).await;
                if streak >= EMPTY_STREAK_WARN_THRESHOLD {
                    tracing::warn!(action = req.action.as_str(), cat_id = req.cat_id, streak, "upstream has returned empty results repeatedly for this tuple");
                }
                Err(AppError::UpstreamError(format!("empty result: {reason:?}")))
            }
        }
    }

    /// Writes through all three tiers, but re-checks L3 first: if some
    /// other path already wrote a fresher row for this tuple while our
    /// fetch was in flight (possible since dedup keys ignore `extra`,
    /// so a `use_cache=false` caller can race a cached one), keep that
    /// row rather than clobbering it with a possibly-stale result.
    #[allow(clippy::too_many_arguments)]
    async fn persist_non_trend(
        &self,
        action: Action,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        outcome: &FetchOutcome,
        fetch_started_at: DateTime<Utc>,
        extra: Option<&Value>,
        collect_duration_ms: i64,
    ) {
        if let Ok(Some(existing)) = self.db.get_mengla_data(action.as_str(), cat_id, granularity, period_key, None).await {
            if existing.updated_at > fetch_started_at {
                tracing::debug!(action = action.as_str(), cat_id, period_key, "skipping write, newer row already persisted");
                return;
            }
        }

        let hash = payload::params_hash(extra);
        self.cache
            .set(action.as_str(), cat_id, granularity, period_key, &outcome.data, "fresh", collect_duration_ms, hash.as_deref())
            .await;
    }

    /// Splits a trend response into one document per point, upserted
    /// directly into L3 — trend reads bypass L1/L2 entirely.
    async fn persist_trend_points(&self, action: Action, cat_id: &str, granularity: Granularity, raw: &Value) {
        let points =
            raw.get("industryTrendRange").and_then(|v| v.get("data")).and_then(Value::as_array).cloned().unwrap_or_default();

        for point in points {
            let timest = point.get("timest").and_then(Value::as_str).unwrap_or_default();
            let point_key = period::timest_to_period_key(granularity, timest);
            let doc = serde_json::json!({ "industryTrendRange": { "data": [point] } });
            let content_hash = blake3::hash(&serde_json::to_vec(&doc).unwrap_or_default()).to_hex().to_string();

            if let Err(err) = self
                .db
                .upsert_mengla_data(action.as_str(), cat_id, granularity, &point_key, &doc, "fresh", 0, &content_hash, None, l3_retention(granularity))
                .await
            {
                tracing::warn!(%err, point_key, "trend point persist failed");
            }
        }
    }
}
