//! Row types for the three durable tables, plus the small status enums
//! whose monotone transitions the job-queue and scheduler invariants rely on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MengLaDataRow {
    pub id: Uuid,
    pub action: String,
    pub cat_id: String,
    pub granularity: String,
    pub period_key: String,
    pub data: Value,
    pub source: String,
    pub collect_duration_ms: i64,
    pub content_hash: String,
    pub params_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Running => "running",
            SubtaskStatus::Success => "success",
            SubtaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub cat_id: String,
    pub start_date: String,
    pub end_date: String,
    pub status: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CrawlSubtask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub action: String,
    pub cat_id: String,
    pub granularity: String,
    pub period_key: String,
    pub status: String,
    pub attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncTaskStatus::Running => "running",
            SyncTaskStatus::Completed => "completed",
            SyncTaskStatus::Failed => "failed",
            SyncTaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SyncTaskLog {
    pub id: Uuid,
    pub task_id: String,
    pub display_name: String,
    pub status: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub trigger_kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}
