//! Hourly pruning of the traffic ledger.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::storage::{DatabaseError, PanelDatabase};

const SECS_PER_DAY: i64 = 24 * 3600;

/// Delete ledger rows older than `retention_days` relative to `now` (unix seconds).
///
/// A retention of zero keeps everything.
pub async fn prune_once(
    db: &PanelDatabase,
    retention_days: u32,
    now: i64,
) -> Result<u64, DatabaseError> {
    if retention_days == 0 {
        return Ok(0);
    }
    let cutoff = now - i64::from(retention_days) * SECS_PER_DAY;
    db.prune_traffic_records(cutoff).await
}

/// Prune every `every` until shutdown.
pub async fn run_retention_loop(
    db: PanelDatabase,
    retention_days: u32,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match prune_once(&db, retention_days, fluxgate_core::db::unix_timestamp()).await {
                    Ok(removed) if removed > 0 => info!(removed, "Traffic ledger pruned"),
                    Err(e) => warn!(error = %e, "Traffic ledger pruning failed"),
                    _ => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
