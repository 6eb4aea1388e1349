//! SQLite persistence.
//!
//! - `migrations`: pool creation, per-connection pragmas, idempotent schema
//! - `repo`: the `Repository` over trades, checkpoints, market metadata and
//!   the derived aggregation tables

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{ChunkOutcome, DerivedCounts, Repository, UpsertOutcome, LAST_COMMITTED_BLOCK};
