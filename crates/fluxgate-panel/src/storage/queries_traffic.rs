//! Traffic flush writes and ledger retention.

use fluxgate_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::TrafficRecord;

/// Accumulated counter deltas for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowIncrement {
    pub raw_in: i64,
    pub raw_out: i64,
    pub billed_in: i64,
    pub billed_out: i64,
}

impl FlowIncrement {
    pub const fn add(&mut self, other: &Self) {
        self.raw_in += other.raw_in;
        self.raw_out += other.raw_out;
        self.billed_in += other.billed_in;
        self.billed_out += other.billed_out;
    }

    pub const fn is_zero(&self) -> bool {
        self.raw_in == 0 && self.raw_out == 0 && self.billed_in == 0 && self.billed_out == 0
    }
}

/// One hour-bucket ledger delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryIncrement {
    pub time: String,
    pub node_id: i64,
    pub forward_id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub raw_in: i64,
    pub raw_out: i64,
    pub billing_flow: i64,
}

/// Everything one flush writes. Built from an aggregator snapshot.
#[derive(Debug, Clone, Default)]
pub struct TrafficBatch {
    pub forwards: Vec<(i64, FlowIncrement)>,
    pub users: Vec<(i64, FlowIncrement)>,
    /// Keyed by `(user_id, tunnel_id)`.
    pub user_tunnels: Vec<((i64, i64), FlowIncrement)>,
    /// Raw bytes only; billed fields are ignored.
    pub nodes: Vec<(i64, FlowIncrement)>,
    pub history: Vec<HistoryIncrement>,
}

impl TrafficBatch {
    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
            && self.users.is_empty()
            && self.user_tunnels.is_empty()
            && self.nodes.is_empty()
            && self.history.is_empty()
    }
}

impl PanelDatabase {
    // =========================================================================
    // Traffic flush
    // =========================================================================

    /// Apply a flush batch in one transaction.
    ///
    /// Every counter write is a relative increment so rows written by other
    /// paths between snapshot and commit are preserved.
    pub async fn apply_traffic(&self, batch: &TrafficBatch) -> Result<(), DatabaseError> {
        if batch.is_empty() {
            return Ok(());
        }

        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        for (id, inc) in &batch.forwards {
            sqlx::query(
                "UPDATE forward SET raw_in_flow = raw_in_flow + ?, raw_out_flow = raw_out_flow + ?,
                     in_flow = in_flow + ?, out_flow = out_flow + ?
                 WHERE id = ?",
            )
            .bind(inc.raw_in)
            .bind(inc.raw_out)
            .bind(inc.billed_in)
            .bind(inc.billed_out)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        for (id, inc) in &batch.users {
            sqlx::query(
                "UPDATE user SET raw_in_flow = raw_in_flow + ?, raw_out_flow = raw_out_flow + ?,
                     in_flow = in_flow + ?, out_flow = out_flow + ?
                 WHERE id = ?",
            )
            .bind(inc.raw_in)
            .bind(inc.raw_out)
            .bind(inc.billed_in)
            .bind(inc.billed_out)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        for ((user_id, tunnel_id), inc) in &batch.user_tunnels {
            sqlx::query(
                "UPDATE user_tunnel SET raw_in_flow = raw_in_flow + ?, raw_out_flow = raw_out_flow + ?,
                     in_flow = in_flow + ?, out_flow = out_flow + ?
                 WHERE user_id = ? AND tunnel_id = ?",
            )
            .bind(inc.raw_in)
            .bind(inc.raw_out)
            .bind(inc.billed_in)
            .bind(inc.billed_out)
            .bind(user_id)
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        }

        for (id, inc) in &batch.nodes {
            sqlx::query(
                "UPDATE node SET raw_in_flow = raw_in_flow + ?, raw_out_flow = raw_out_flow + ? WHERE id = ?",
            )
            .bind(inc.raw_in)
            .bind(inc.raw_out)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        for h in &batch.history {
            sqlx::query(
                "INSERT INTO traffic_record (time, node_id, forward_id, user_id, tunnel_id, raw_in, raw_out, billing_flow, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(time, node_id, forward_id, user_id, tunnel_id) DO UPDATE SET
                     raw_in = raw_in + excluded.raw_in,
                     raw_out = raw_out + excluded.raw_out,
                     billing_flow = billing_flow + excluded.billing_flow",
            )
            .bind(&h.time)
            .bind(h.node_id)
            .bind(h.forward_id)
            .bind(h.user_id)
            .bind(h.tunnel_id)
            .bind(h.raw_in)
            .bind(h.raw_out)
            .bind(h.billing_flow)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Ledger rows for a forward, oldest bucket first.
    pub async fn list_traffic_records(
        &self,
        forward_id: i64,
    ) -> Result<Vec<TrafficRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, TrafficRecord>(
            "SELECT * FROM traffic_record WHERE forward_id = ? ORDER BY time, node_id",
        )
        .bind(forward_id)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Delete ledger rows created before `cutoff` (unix seconds).
    pub async fn prune_traffic_records(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM traffic_record WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
