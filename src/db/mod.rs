//! Durable storage: the `mengla_data` artifact table, crawl job/subtask
//! plans, and sync-task run logs, all on Postgres via `sqlx`.
//!
//! A document store's "collection" becomes a table here; the opaque
//! payload each identity key carries is stored in a `JSONB` column so
//! callers still never see typed columns for `data` itself, preserving the
//! contract a Mongo-backed original would have presented.

pub mod migrations;
pub mod models;
pub mod pool;

pub use models::*;
pub use pool::Database;
