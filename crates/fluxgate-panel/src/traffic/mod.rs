//! Traffic accounting: report ingestion, billing, batched flush, and ledger retention.

mod aggregator;
mod ingest;
mod retention;

#[cfg(test)]
mod ingest_tests;

pub use aggregator::{HistoryDelta, HistoryKey, TrafficAggregator, TrafficSample};
pub use ingest::{
    IngestJob, IngestQueue, IngestWorker, ReportKind, billed_bytes, hour_bucket, raw_bytes,
};
pub use retention::{prune_once, run_retention_loop};
