//! Long-running jobs built from the chain, storage and engine layers.

pub mod aggregator;
pub mod backfill;

pub use aggregator::{AggregationError, AggregationReport, Aggregator};
pub use backfill::{BackfillError, BackfillReport, BackfillRequest, Backfiller, StopReason};
