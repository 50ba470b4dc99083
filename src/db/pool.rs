//! Postgres connection pool and every durable query the collection fabric
//! issues against `mengla_data`, `crawl_jobs`, `crawl_subtasks`, and
//! `sync_task_logs`.
//!
//! Generalizes the teacher's `ConnectionPool` (min/max connections, connect
//! timeout, health-checked lifecycle) from SQLite to Postgres; the
//! statement-cache and busy-timeout knobs specific to SQLite are dropped
//! since `sqlx::PgPool` manages those itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::period::Granularity;

use super::models::{CrawlJob, CrawlSubtask, JobStatus, MengLaDataRow, SubtaskStatus, SyncTaskLog, SyncTaskStatus, SyncTrigger};

/// Pool configuration. `max_connections` defaults conservatively since this
/// service's write volume is bounded by the serial upstream, not by client
/// concurrency.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            min_connections: 2,
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Thin wrapper over `PgPool` exposing the collection fabric's durable
/// operations as typed async methods.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: DatabaseConfig) -> sqlx::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---- mengla_data -----------------------------------------------------

    /// Idempotent upsert keyed by the identity tuple. Returns the row as
    /// persisted (reflecting `ON CONFLICT` resolution).
    ///
    /// When the incoming `content_hash` matches the stored row's, the
    /// upstream result is unchanged since the last write: every column is
    /// left as-is except `expired_at`, which is always refreshed so an
    /// unchanged-but-still-being-collected document doesn't expire out from
    /// under a caller that keeps re-fetching it.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_mengla_data(
        &self,
        action: &str,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        data: &Value,
        source: &str,
        collect_duration_ms: i64,
        content_hash: &str,
        params_hash: Option<&str>,
        retention: Duration,
    ) -> sqlx::Result<MengLaDataRow> {
        let expired_at = Utc::now() + chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(30));
        sqlx::query_as::<_, MengLaDataRow>(
            r#"
            INSERT INTO mengla_data
                (id, action, cat_id, granularity, period_key, data, source,
                 collect_duration_ms, content_hash, params_hash, created_at, updated_at, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), now(), $11)
            ON CONFLICT (action, cat_id, granularity, period_key) DO UPDATE SET
                data = CASE WHEN mengla_data.content_hash = EXCLUDED.content_hash THEN mengla_data.data ELSE EXCLUDED.data END,
                source = CASE WHEN mengla_data.content_hash = EXCLUDED.content_hash THEN mengla_data.source ELSE EXCLUDED.source END,
                collect_duration_ms = CASE WHEN mengla_data.content_hash = EXCLUDED.content_hash THEN mengla_data.collect_duration_ms ELSE EXCLUDED.collect_duration_ms END,
                content_hash = EXCLUDED.content_hash,
                params_hash = CASE WHEN mengla_data.content_hash = EXCLUDED.content_hash THEN mengla_data.params_hash ELSE EXCLUDED.params_hash END,
                updated_at = CASE WHEN mengla_data.content_hash = EXCLUDED.content_hash THEN mengla_data.updated_at ELSE now() END,
                expired_at = EXCLUDED.expired_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action)
        .bind(cat_id)
        .bind(granularity.as_str())
        .bind(period_key)
        .bind(data)
        .bind(source)
        .bind(collect_duration_ms)
        .bind(content_hash)
        .bind(params_hash)
        .bind(expired_at)
        .fetch_one(&self.pool)
        .await
    }

    /// Fetch a single identity tuple, or `None` on miss. A document whose
    /// stored `params_hash` differs from the caller's `params_hash` doesn't
    /// match — it was produced from different caller-supplied filters and
    /// is not a valid substitute. Pass `None` to skip the check entirely
    /// (used by the pre-write race check, which only cares about freshness).
    pub async fn get_mengla_data(
        &self,
        action: &str,
        cat_id: &str,
        granularity: Granularity,
        period_key: &str,
        params_hash: Option<&str>,
    ) -> sqlx::Result<Option<MengLaDataRow>> {
        sqlx::query_as::<_, MengLaDataRow>(
            r#"
            SELECT * FROM mengla_data
            WHERE action = $1 AND cat_id = $2 AND granularity = $3 AND period_key = $4
              AND (params_hash IS NULL OR $5::text IS NULL OR params_hash = $5)
            "#,
        )
        .bind(action)
        .bind(cat_id)
        .bind(granularity.as_str())
        .bind(period_key)
        .bind(params_hash)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fetch every trend point document for the given period keys, in no
    /// particular order — the collector sorts by `timest` after merging.
    /// Same `params_hash` semantics as [`Self::get_mengla_data`].
    pub async fn get_mengla_data_for_keys(
        &self,
        action: &str,
        cat_id: &str,
        granularity: Granularity,
        period_keys: &[String],
        params_hash: Option<&str>,
    ) -> sqlx::Result<Vec<MengLaDataRow>> {
        sqlx::query_as::<_, MengLaDataRow>(
            r#"
            SELECT * FROM mengla_data
            WHERE action = $1 AND cat_id = $2 AND granularity = $3 AND period_key = ANY($4)
              AND (params_hash IS NULL OR $5::text IS NULL OR params_hash = $5)
            "#,
        )
        .bind(action)
        .bind(cat_id)
        .bind(granularity.as_str())
        .bind(period_keys)
        .bind(params_hash)
        .fetch_all(&self.pool)
        .await
    }

    /// Rows updated at or after `since`, most-recent first, bounded by
    /// `limit` — the source stream for `cache.warmup`.
    pub async fn recent_mengla_data(
        &self,
        action: Option<&str>,
        cat_id: Option<&str>,
        granularity: Option<Granularity>,
        limit: i64,
    ) -> sqlx::Result<Vec<MengLaDataRow>> {
        sqlx::query_as::<_, MengLaDataRow>(
            r#"
            SELECT * FROM mengla_data
            WHERE ($1::text IS NULL OR action = $1)
              AND ($2::text IS NULL OR cat_id = $2)
              AND ($3::text IS NULL OR granularity = $3)
            ORDER BY updated_at DESC
            LIMIT $4
            "#,
        )
        .bind(action)
        .bind(cat_id)
        .bind(granularity.map(Granularity::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Deletes rows past their TTL; the Postgres substitute for a Mongo TTL
    /// index monitor. Returns the number of rows removed.
    pub async fn gc_expired_documents(&self, batch_size: i64) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM mengla_data WHERE id IN (
                SELECT id FROM mengla_data WHERE expired_at <= now() LIMIT $1
            )
            "#,
        )
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Wipes every durable collected document. Only reachable from the
    /// admin data-purge route with `confirm: true`.
    pub async fn purge_mengla_data(&self) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM mengla_data").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ---- crawl_jobs / crawl_subtasks --------------------------------------

    /// Insert a parent job and enumerate its subtasks (one per action ×
    /// granularity × period key in range), per `spec.md` §4.5.
    pub async fn create_crawl_job(
        &self,
        cat_id: &str,
        start_date: &str,
        end_date: &str,
        granularities: &[Granularity],
        actions: &[String],
    ) -> sqlx::Result<CrawlJob> {
        let mut tx = self.pool.begin().await?;
        let job_id = Uuid::new_v4();

        let mut subtask_rows: Vec<(String, Granularity, String)> = Vec::new();
        for &g in granularities {
            let keys = crate::period::period_keys_in_range(g, start_date, end_date);
            for action in actions {
                for key in &keys {
                    subtask_rows.push((action.clone(), g, key.clone()));
                }
            }
        }
        let total = subtask_rows.len() as i64;

        sqlx::query(
            r#"
            INSERT INTO crawl_jobs (id, cat_id, start_date, end_date, status, total, completed, failed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, now(), now())
            "#,
        )
        .bind(job_id)
        .bind(cat_id)
        .bind(start_date)
        .bind(end_date)
        .bind(JobStatus::Pending.as_str())
        .bind(total)
        .execute(&mut *tx)
        .await?;

        for (action, granularity, period_key) in &subtask_rows {
            sqlx::query(
                r#"
                INSERT INTO crawl_subtasks (id, job_id, action, cat_id, granularity, period_key, status, attempts, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0, now(), now())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job_id)
            .bind(action)
            .bind(cat_id)
            .bind(granularity.as_str())
            .bind(period_key)
            .bind(SubtaskStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let job = sqlx::query_as::<_, CrawlJob>("SELECT * FROM crawl_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Picks the oldest RUNNING-or-PENDING parent, atomically marking a
    /// PENDING one RUNNING.
    pub async fn get_next_job(&self) -> sqlx::Result<Option<CrawlJob>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, CrawlJob>(
            r#"
            SELECT * FROM crawl_jobs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let job = match row {
            Some(j) if j.status == JobStatus::Pending.as_str() => {
                sqlx::query_as::<_, CrawlJob>(
                    "UPDATE crawl_jobs SET status = 'running', updated_at = now() WHERE id = $1 RETURNING *",
                )
                .bind(j.id)
                .fetch_one(&mut *tx)
                .await?
            }
            Some(j) => j,
            None => {
                tx.commit().await?;
                return Ok(None);
            }
        };
        tx.commit().await?;
        Ok(Some(job))
    }

    /// Atomic find-and-update claim: at most one worker ever observes a
    /// given subtask transition out of PENDING (invariant 4, linearizable
    /// claim). `FOR UPDATE SKIP LOCKED` plus the `status = 'pending'`
    /// precondition in the same statement is what makes this safe across
    /// concurrent workers without an external lock.
    pub async fn claim_subtasks(&self, job_id: Uuid, n: i64) -> sqlx::Result<Vec<CrawlSubtask>> {
        sqlx::query_as::<_, CrawlSubtask>(
            r#"
            UPDATE crawl_subtasks SET
                status = 'running',
                started_at = now(),
                updated_at = now(),
                attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM crawl_subtasks
                WHERE job_id = $1 AND status = 'pending'
                ORDER BY period_key ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn set_subtask_success(&self, subtask_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE crawl_subtasks SET status = 'success', finished_at = now(), updated_at = now() WHERE id = $1")
            .bind(subtask_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// On failure: if `attempts` (already incremented by [`Self::claim_subtasks`])
    /// hasn't reached `max_attempts` yet, returns the subtask to `pending` so
    /// the next claim picks it up again; otherwise marks it terminally
    /// `failed`. `last_error` is capped at 2000 chars, matching the
    /// original's defensive truncation against pathological error strings.
    pub async fn set_subtask_failed(&self, subtask_id: Uuid, error: &str, max_attempts: i32) -> sqlx::Result<()> {
        let capped: String = error.chars().take(2000).collect();
        sqlx::query(
            r#"
            UPDATE crawl_subtasks SET
                status = CASE WHEN attempts < $3 THEN 'pending' ELSE 'failed' END,
                finished_at = CASE WHEN attempts < $3 THEN NULL ELSE now() END,
                updated_at = now(),
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(subtask_id)
        .bind(capped)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn inc_job_stats(&self, job_id: Uuid, completed: i64, failed: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE crawl_jobs SET completed = completed + $2, failed = failed + $3, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(completed)
            .bind(failed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// If no subtask remains PENDING or RUNNING, transitions the parent to
    /// COMPLETED or FAILED (FAILED iff any child is FAILED).
    pub async fn finish_job_if_done(&self, job_id: Uuid) -> sqlx::Result<Option<JobStatus>> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE status IN ('pending', 'running')) AS open_count,
                count(*) FILTER (WHERE status = 'failed') AS failed_count
            FROM crawl_subtasks WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        let open_count: i64 = row.try_get("open_count")?;
        let failed_count: i64 = row.try_get("failed_count")?;
        if open_count > 0 {
            return Ok(None);
        }

        let status = if failed_count > 0 { JobStatus::Failed } else { JobStatus::Completed };
        sqlx::query("UPDATE crawl_jobs SET status = $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(Some(status))
    }

    // ---- sync_task_logs ----------------------------------------------------

    /// Atomic create-with-check: fails (returns `Ok(None)`) if a RUNNING row
    /// for `task_id` already exists, enforcing "exactly one RUNNING row per
    /// task id" without a distributed lock.
    pub async fn start_sync_task_log(
        &self,
        task_id: &str,
        display_name: &str,
        trigger: SyncTrigger,
        total: i64,
    ) -> sqlx::Result<Option<SyncTaskLog>> {
        let mut tx = self.pool.begin().await?;
        let existing: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sync_task_logs WHERE task_id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let log = sqlx::query_as::<_, SyncTaskLog>(
            r#"
            INSERT INTO sync_task_logs
                (id, task_id, display_name, status, total, completed, failed, trigger_kind, started_at, updated_at)
            VALUES ($1, $2, $3, 'running', $4, 0, 0, $5, now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(display_name)
        .bind(total)
        .bind(trigger.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(log))
    }

    /// Re-probe used by the scheduler's overlap guard double-check: counts
    /// RUNNING rows for `task_id` *excluding* `own_id`.
    pub async fn count_other_running(&self, task_id: &str, own_id: Uuid) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM sync_task_logs WHERE task_id = $1 AND status = 'running' AND id != $2")
            .bind(task_id)
            .bind(own_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn finish_sync_task_log(&self, id: Uuid, status: SyncTaskStatus, error: Option<&str>) -> sqlx::Result<()> {
        sqlx::query("UPDATE sync_task_logs SET status = $2, finished_at = now(), updated_at = now(), error_message = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(error.map(|e| e.chars().take(2000).collect::<String>()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_sync_task_progress(&self, id: Uuid, completed: i64, failed: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE sync_task_logs SET completed = completed + $2, failed = failed + $3, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(completed)
            .bind(failed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Find-and-update with a `status = 'running'` precondition: marks a
    /// running log CANCELLED, returning `true` only if a row actually
    /// transitioned (it hadn't already finished on its own).
    pub async fn cancel_sync_task(&self, id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_task_logs SET status = 'cancelled', finished_at = now(), updated_at = now() WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Startup recovery: every log still RUNNING belonged to a process that
    /// no longer exists.
    pub async fn fail_stale_running_logs(&self) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_task_logs SET status = 'failed', finished_at = now(), updated_at = now(), error_message = 'interrupted by restart' WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn todays_sync_task_logs(&self) -> sqlx::Result<Vec<SyncTaskLog>> {
        sqlx::query_as::<_, SyncTaskLog>(
            "SELECT * FROM sync_task_logs WHERE started_at >= date_trunc('day', now()) ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_sync_task_log(&self, id: Uuid) -> sqlx::Result<Option<SyncTaskLog>> {
        sqlx::query_as::<_, SyncTaskLog>("SELECT * FROM sync_task_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn delete_sync_task_log(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM sync_task_logs WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }
}

/// Timestamp helper shared by admin handlers that report log ages.
pub fn age_seconds(since: DateTime<Utc>) -> i64 {
    (Utc::now() - since).num_seconds().max(0)
}
