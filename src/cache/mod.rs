//! Three-tier read-through / write-through cache: an in-process `moka`
//! cache (L1), Redis (L2), and the durable `mengla_data` table (L3).
//!
//! Generalizes the teacher's `enterprise::cache` tiering concept — three
//! named levels with promotion on hit — from a single generic
//! `MultiTierCache<K, V>` simulating all three tiers in memory into three
//! concrete backends, because L2 and L3 here are genuinely different
//! systems (Redis, Postgres) rather than interchangeable in-process maps.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache as MokaCache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::db::Database;
use crate::period::Granularity;

/// Where a `get` was ultimately satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    L1,
    L2,
    L3,
    Miss,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::L1 => "l1",
            Source::L2 => "l2",
            Source::L3 => "l3",
            Source::Miss => "miss",
        }
    }
}

/// L2 TTL by granularity, per `spec.md` §3: 4h / 24h / 7d / 30d.
fn l2_ttl(granularity: Granularity) -> Duration {
    match granularity {
        Granularity::Day => Duration::from_secs(4 * 3600),
        Granularity::Month => Duration::from_secs(24 * 3600),
        Granularity::Quarter => Duration::from_secs(7 * 24 * 3600),
        Granularity::Year => Duration::from_secs(30 * 24 * 3600),
    }
}

/// L3 retention by granularity, per `spec.md` §3: 30d / 90d / 365d / 730d.
pub fn l3_retention(granularity: Granularity) -> Duration {
    match granularity {
        Granularity::Day => Duration::from_secs(30 * 24 * 3600),
        Granularity::Month => Duration::from_secs(90 * 24 * 3600),
        Granularity::Quarter => Duration::from_secs(365 * 24 * 3600),
        Granularity::Year => Duration::from_secs(730 * 24 * 3600),
    }
}

fn l2_key(action: &str, cat_id: &str, granularity: Granularity, period_key: &str) -> String {
    let cat = if cat_id.is_empty() { "all" } else { cat_id };
    format!("mengla:data:{action}:{cat}:{}:{period_key}", granularity.as_str())
}

fn empty_streak_key(action: &str, cat_id: &str) -> String {
    format!("mengla:empty_streak:{action}:{cat_id}")
}

/// Running totals surfaced by `GET /admin/cache/stats`.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Counters {
    l1_hits: std::sync::atomic::AtomicU64,
    l2_hits: std::sync::atomic::AtomicU64,
    l3_hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

/// The three-tier cache manager driving every identity-tuple read/write in
/// the collection fabric.
#[derive(Clone)]
pub struct CacheManager {
    l1: MokaCache<String, Value>,
    redis: ConnectionManager,
    db: Database,
    counters: Arc<Counters>,
}

impl CacheManager {
    pub fn new(l1_capacity: u64, l1_ttl: Duration, redis: ConnectionManager, db: Database) -> Self {
        let l1 = MokaCache::builder()
            .max_capacity(l1_capacity)
            .time_to_live(l1_ttl)
            .build();
        Self { l1, redis, db, counters: Arc::new(Counters::default()) }
    }

    /// Probe L1, then L2, then L3; promote upward on any hit below L1.
    /// Never touches upstream. Trend actions are never served here — the
    /// collector reads L3 directly per point (`spec.md` §4.1's "not served
    /// by L1/L2" rule).
    ///
    /// Neither L1 nor L2 carries `params_hash` — they're keyed on the
    /// identity tuple alone. A request with a non-empty `params_hash` (it
    /// supplied caller-specific `extra` filters) therefore skips straight to
    /// L3, the only tier that can verify the stored document was produced
    /// from the same filters, and a hit there is never promoted upward —
    /// doing so would let a filtered result leak into the generic key and
    /// serve a later default-filter request.
    pub async fn get(
        &self,
        action: &str,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        params_hash: Option<&str>,
    ) -> (Option<Value>, Source) {
        use std::sync::atomic::Ordering::Relaxed;
        let key = l2_key(action, cat_id, granularity, period_key);

        if params_hash.is_none() {
            if let Some(v) = self.l1.get(&key).await {
                self.counters.l1_hits.fetch_add(1, Relaxed);
                return (Some(v), Source::L1);
            }

            let mut conn = self.redis.clone();
            if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                    self.counters.l2_hits.fetch_add(1, Relaxed);
                    self.l1.insert(key.clone(), value.clone()).await;
                    return (Some(value), Source::L2);
                }
            }
        }

        if let Ok(Some(row)) = self.db.get_mengla_data(action, cat_id, granularity, period_key, params_hash).await {
            self.counters.l3_hits.fetch_add(1, Relaxed);
            if params_hash.is_none() {
                self.populate_upper_tiers(&key, &row.data, granularity).await;
            }
            return (Some(row.data), Source::L3);
        }

        self.counters.misses.fetch_add(1, Relaxed);
        (None, Source::Miss)
    }

    async fn populate_upper_tiers(&self, key: &str, value: &Value, granularity: Granularity) {
        self.l1.insert(key.to_string(), value.clone()).await;
        if let Ok(raw) = serde_json::to_string(value) {
            let mut conn = self.redis.clone();
            let _: Result<(), _> = conn.set_ex(key, raw, l2_ttl(granularity).as_secs()).await;
        }
    }

    /// Write all three tiers. A per-layer failure is logged and does not
    /// abort the others — cache writes are always best-effort; the caller
    /// already has the result regardless.
    #[allow(clippy::too_many_arguments)]
    pub async fn set(
        &self,
        action: &str,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        value: &Value,
        source: &str,
        collect_duration_ms: i64,
        params_hash: Option<&str>,
    ) {
        let key = l2_key(action, cat_id, granularity, period_key);
        self.l1.insert(key.clone(), value.clone()).await;

        if let Ok(raw) = serde_json::to_string(value) {
            let mut conn = self.redis.clone();
            if let Err(err) = conn.set_ex::<_, _, ()>(&key, raw, l2_ttl(granularity).as_secs()).await {
                tracing::warn!(%err, key, "L2 cache write failed");
            }
        }

        let content_hash = blake3::hash(&serde_json::to_vec(value).unwrap_or_default()).to_hex().to_string();
        if let Err(err) = self
            .db
            .upsert_mengla_data(
                action,
                cat_id,
                granularity,
                period_key,
                value,
                source,
                collect_duration_ms,
                &content_hash,
                params_hash,
                l3_retention(granularity),
            )
            .await
        {
            tracing::warn!(%err, key, "L3 durable write failed");
        }
    }

    /// Evicts L1 and L2; never touches L3.
    pub async fn invalidate(&self, action: &str, cat_id: &str, granularity: Granularity, period_key: &str) {
        let key = l2_key(action, cat_id, granularity, period_key);
        self.l1.invalidate(&key).await;
        let mut conn = self.redis.clone();
        let _: Result<(), _> = conn.del(&key).await;
    }

    pub async fn clear_l1(&self) {
        self.l1.invalidate_all();
    }

    /// Bumps `mengla:empty_streak:<action>:<cat_id>` and returns the new
    /// count. Cross-process so a consecutive-empty run is visible no matter
    /// which replica served the request.
    pub async fn record_empty_result(&self, action: &str, cat_id: &str) -> i64 {
        let key = empty_streak_key(action, cat_id);
        let mut conn = self.redis.clone();
        conn.incr(&key, 1).await.unwrap_or(0)
    }

    /// Clears the streak on any non-empty result.
    pub async fn reset_empty_streak(&self, action: &str, cat_id: &str) {
        let key = empty_streak_key(action, cat_id);
        let mut conn = self.redis.clone();
        let _: Result<(), _> = conn.del(&key).await;
    }

    pub fn get_stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering::Relaxed;
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Relaxed),
            l2_hits: self.counters.l2_hits.load(Relaxed),
            l3_hits: self.counters.l3_hits.load(Relaxed),
            misses: self.counters.misses.load(Relaxed),
        }
    }

    /// Stream the most recently updated L3 rows matching the filter and
    /// populate L1+L2. Per-row errors are counted, not fatal. Returns
    /// `(populated, errors)`.
    pub async fn warmup(
        &self,
        action: Option<&str>,
        cat_id: Option<&str>,
        granularity: Option<Granularity>,
        limit: i64,
    ) -> (u64, u64) {
        let rows = match self.db.recent_mengla_data(action, cat_id, granularity, limit).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%err, "warmup query failed");
                return (0, 0);
            }
        };

        let (mut ok, mut errs) = (0u64, 0u64);
        for row in rows {
            let Some(g) = parse_granularity(&row.granularity) else {
                errs += 1;
                continue;
            };
            let key = l2_key(&row.action, &row.cat_id, g, &row.period_key);
            self.populate_upper_tiers(&key, &row.data, g).await;
            ok += 1;
        }
        (ok, errs)
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
