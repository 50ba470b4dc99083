//! Schema migrations run via `sqlx::migrate!`, reading `.sql` files from
//! `/migrations` at the workspace root.
//!
//! The teacher's database layer hand-rolled a `Migration` trait with
//! `up`/`down` methods; since this crate already depends on `sqlx`, its own
//! migration runner is the idiomatic choice over a bespoke one — see
//! `Database::migrate` in `pool.rs`, which is the only entry point needed.

pub type MigrationVersion = i64;
