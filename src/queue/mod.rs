//! The durable crawl-job worker loop: claims batches of `crawl_subtasks`,
//! drives each through the collector, and rolls parent-job progress and
//! completion — the queue-driven half of `spec.md` §4.5, layered on top of
//! the claim/progress primitives in [`crate::db::pool::Database`].
//!
//! Adapted from the teacher's Redis-backed priority queue
//! (`scheduling/queue.rs`): the priority levels and Redis list storage are
//! dropped since the durable store's `FOR UPDATE SKIP LOCKED` claim already
//! gives atomic, ordered dequeue without an external queue structure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::collector::Collector;
use crate::db::{CrawlSubtask, Database, JobStatus};
use crate::period::Granularity;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A failed subtask is returned to `pending` for another claim until its
/// `attempts` reaches this many; past that it's marked FAILED terminally.
const MAX_SUBTASK_ATTEMPTS: i32 = 3;

/// Drains `crawl_jobs`/`crawl_subtasks` one batch at a time. Safe to run
/// several instances concurrently — `claim_subtasks` is linearizable.
pub struct CrawlWorker {
    db: Database,
    collector: Arc<Collector>,
    batch_size: i64,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl CrawlWorker {
    pub fn new(db: Database, collector: Arc<Collector>, batch_size: i64, poll_interval: Duration) -> Self {
        Self { db, collector, batch_size, poll_interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs until `shutdown` is set, sleeping `poll_interval` whenever a
    /// tick claims nothing.
    pub async fn run(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.tick().await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "crawl worker tick failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One pass: picks the oldest open job, claims a batch of its subtasks,
    /// processes each, and finalizes the job if nothing remains open.
    /// Returns the number of subtasks processed.
    pub async fn tick(&self) -> QueueResult<usize> {
        let Some(job) = self.db.get_next_job().await? else {
            return Ok(0);
        };

        let subtasks = self.db.claim_subtasks(job.id, self.batch_size).await?;
        if subtasks.is_empty() {
            self.db.finish_job_if_done(job.id).await?;
            return Ok(0);
        }

        let (mut completed, mut failed) = (0i64, 0i64);
        for subtask in &subtasks {
            if self.process_subtask(subtask).await {
                completed += 1;
            } else {
                failed += 1;
            }
        }

        self.db.inc_job_stats(job.id, completed, failed).await?;
        if let Some(status) = self.db.finish_job_if_done(job.id).await? {
            tracing::info!(job_id = %job.id, ?status, "crawl job finished");
        }

        Ok(subtasks.len())
    }

    /// Returns `true` on success. A granularity that can't be parsed is a
    /// permanent error, not a transient upstream failure, so it fails the
    /// subtask immediately regardless of attempts remaining. An upstream
    /// failure instead goes through [`MAX_SUBTASK_ATTEMPTS`]: `set_subtask_failed`
    /// returns the subtask to `pending` until that budget is exhausted.
    async fn process_subtask(&self, subtask: &CrawlSubtask) -> bool {
        let Some(granularity) = parse_granularity(&subtask.granularity) else {
            let _ = self.db.set_subtask_failed(subtask.id, "unparseable granularity", 0).await;
            return false;
        };

        let result = self
            .collector
            .query(&subtask.action, &subtask.cat_id, Some(granularity.as_str()), &subtask.period_key, None, false)
            .await;

        match result {
            Ok(_) => {
                let _ = self.db.set_subtask_success(subtask.id).await;
                true
            }
            Err(err) => {
                let _ = self.db.set_subtask_failed(subtask.id, &err.to_string(), MAX_SUBTASK_ATTEMPTS).await;
                false
            }
        }
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

/// Enqueue a full backfill crawl job, used by the admin surface and the
/// scheduler's `backfill_check` job alike.
pub async fn enqueue_full_crawl(
    db: &Database,
    cat_id: &str,
    start_date: &str,
    end_date: &str,
    granularities: &[Granularity],
    actions: &[String],
) -> QueueResult<Uuid> {
    let job = db.create_crawl_job(cat_id, start_date, end_date, granularities, actions).await?;
    Ok(job.id)
}

pub fn job_is_terminal(status: &str) -> bool {
    status == JobStatus::Completed.as_str() || status == JobStatus::Failed.as_str() || status == JobStatus::Cancelled.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_granularity() {
        assert_eq!(parse_granularity("day"), Some(Granularity::Day));
        assert_eq!(parse_granularity("month"), Some(Granularity::Month));
        assert_eq!(parse_granularity("quarter"), Some(Granularity::Quarter));
        assert_eq!(parse_granularity("year"), Some(Granularity::Year));
        assert_eq!(parse_granularity("decade"), None);
    }

    #[test]
    fn terminal_statuses_match_job_status_enum() {
        assert!(job_is_terminal(JobStatus::Completed.as_str()));
        assert!(job_is_terminal(JobStatus::Failed.as_str()));
        assert!(job_is_terminal(JobStatus::Cancelled.as_str()));
        assert!(!job_is_terminal(JobStatus::Pending.as_str()));
        assert!(!job_is_terminal(JobStatus::Running.as_str()));
    }
}
