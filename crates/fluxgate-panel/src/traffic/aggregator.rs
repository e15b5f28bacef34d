//! In-memory traffic accumulation with periodic transactional flush.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::storage::{
    DatabaseError, FlowIncrement, HistoryIncrement, PanelDatabase, TrafficBatch,
};

/// Composite key of one hour-bucket ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    /// `YYYY-MM-DD HH:00:00`.
    pub hour: String,
    pub node_id: i64,
    pub forward_id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryDelta {
    pub raw_in: i64,
    pub raw_out: i64,
    pub billing_flow: i64,
}

/// Everything one processed report contributes, applied under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSample {
    pub forward_id: i64,
    pub user_id: i64,
    /// `(user_id, tunnel_id)` when a per-tunnel grant applies.
    pub grant: Option<(i64, i64)>,
    pub node_id: i64,
    pub flow: FlowIncrement,
    pub history: HistoryKey,
}

#[derive(Default)]
struct Accumulators {
    forwards: HashMap<i64, FlowIncrement>,
    users: HashMap<i64, FlowIncrement>,
    user_tunnels: HashMap<(i64, i64), FlowIncrement>,
    nodes: HashMap<i64, FlowIncrement>,
    history: HashMap<HistoryKey, HistoryDelta>,
}

impl Accumulators {
    fn is_empty(&self) -> bool {
        self.forwards.is_empty()
            && self.users.is_empty()
            && self.user_tunnels.is_empty()
            && self.nodes.is_empty()
            && self.history.is_empty()
    }

    fn into_batch(self) -> TrafficBatch {
        TrafficBatch {
            forwards: self.forwards.into_iter().collect(),
            users: self.users.into_iter().collect(),
            user_tunnels: self.user_tunnels.into_iter().collect(),
            nodes: self.nodes.into_iter().collect(),
            history: self
                .history
                .into_iter()
                .map(|(key, delta)| HistoryIncrement {
                    time: key.hour,
                    node_id: key.node_id,
                    forward_id: key.forward_id,
                    user_id: key.user_id,
                    tunnel_id: key.tunnel_id,
                    raw_in: delta.raw_in,
                    raw_out: delta.raw_out,
                    billing_flow: delta.billing_flow,
                })
                .collect(),
        }
    }
}

/// Accumulates traffic deltas; never touches storage on the ingest path.
#[derive(Default)]
pub struct TrafficAggregator {
    inner: Mutex<Accumulators>,
}

impl TrafficAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_maps<R>(&self, f: impl FnOnce(&mut Accumulators) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn add_forward(&self, forward_id: i64, delta: FlowIncrement) {
        self.with_maps(|m| m.forwards.entry(forward_id).or_default().add(&delta));
    }

    pub fn add_user(&self, user_id: i64, delta: FlowIncrement) {
        self.with_maps(|m| m.users.entry(user_id).or_default().add(&delta));
    }

    pub fn add_user_tunnel(&self, user_id: i64, tunnel_id: i64, delta: FlowIncrement) {
        self.with_maps(|m| {
            m.user_tunnels
                .entry((user_id, tunnel_id))
                .or_default()
                .add(&delta);
        });
    }

    /// Nodes only track raw bytes.
    pub fn add_node(&self, node_id: i64, raw_in: i64, raw_out: i64) {
        let delta = FlowIncrement {
            raw_in,
            raw_out,
            ..FlowIncrement::default()
        };
        self.with_maps(|m| m.nodes.entry(node_id).or_default().add(&delta));
    }

    pub fn add_history(&self, key: HistoryKey, delta: HistoryDelta) {
        self.with_maps(|m| {
            let entry = m.history.entry(key).or_default();
            entry.raw_in += delta.raw_in;
            entry.raw_out += delta.raw_out;
            entry.billing_flow += delta.billing_flow;
        });
    }

    /// Apply every map update for one report atomically with respect to flush.
    pub fn record(&self, sample: TrafficSample) {
        let flow = sample.flow;
        self.with_maps(move |m| {
            m.forwards.entry(sample.forward_id).or_default().add(&flow);
            m.users.entry(sample.user_id).or_default().add(&flow);
            if let Some(grant) = sample.grant {
                m.user_tunnels.entry(grant).or_default().add(&flow);
            }
            m.nodes.entry(sample.node_id).or_default().add(&FlowIncrement {
                raw_in: flow.raw_in,
                raw_out: flow.raw_out,
                ..FlowIncrement::default()
            });
            let entry = m.history.entry(sample.history).or_default();
            entry.raw_in += flow.raw_in;
            entry.raw_out += flow.raw_out;
            entry.billing_flow += flow.billed_in + flow.billed_out;
        });
    }

    /// Swap the maps for empty ones and return what was accumulated.
    pub fn take_batch(&self) -> TrafficBatch {
        let taken = self.with_maps(std::mem::take);
        if taken.is_empty() {
            TrafficBatch::default()
        } else {
            taken.into_batch()
        }
    }

    /// Write one snapshot to storage. Returns the number of entities written.
    ///
    /// On storage failure the snapshot is dropped; the next cycle carries on
    /// with newly accumulated deltas.
    pub async fn flush(&self, db: &PanelDatabase) -> Result<usize, DatabaseError> {
        let batch = self.take_batch();
        if batch.is_empty() {
            return Ok(0);
        }
        let entities = batch.forwards.len()
            + batch.users.len()
            + batch.user_tunnels.len()
            + batch.nodes.len()
            + batch.history.len();
        db.apply_traffic(&batch).await?;
        Ok(entities)
    }

    /// Flush on a fixed interval until shutdown, then flush once more.
    pub async fn run_flush_loop(
        &self,
        db: PanelDatabase,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_logged(&db).await,
                _ = shutdown.changed() => break,
            }
        }
        self.flush_logged(&db).await;
        info!("Traffic flush loop stopped");
    }

    async fn flush_logged(&self, db: &PanelDatabase) {
        match self.flush(db).await {
            Ok(0) => {}
            Ok(entities) => debug!(entities, "Traffic flushed"),
            Err(e) => warn!(error = %e, "Traffic flush failed; deltas from this cycle dropped"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn key(forward_id: i64) -> HistoryKey {
        HistoryKey {
            hour: "2026-10-16 10:00:00".into(),
            node_id: 1,
            forward_id,
            user_id: 1,
            tunnel_id: 1,
        }
    }

    fn raw(bytes: i64) -> FlowIncrement {
        FlowIncrement {
            raw_in: bytes,
            raw_out: bytes,
            billed_in: bytes,
            billed_out: bytes,
        }
    }

    #[test]
    fn deltas_accumulate_rather_than_overwrite() {
        let agg = TrafficAggregator::new();
        agg.add_forward(1, raw(10));
        agg.add_forward(1, raw(5));
        agg.add_node(3, 7, 8);
        agg.add_node(3, 1, 1);

        let batch = agg.take_batch();
        assert_eq!(batch.forwards, vec![(1, raw(15))]);
        assert_eq!(batch.nodes[0].1.raw_in, 8);
        assert_eq!(batch.nodes[0].1.billed_in, 0);
    }

    #[test]
    fn take_batch_empties_the_maps() {
        let agg = TrafficAggregator::new();
        agg.add_user(2, raw(1));
        agg.add_history(key(1), HistoryDelta {
            raw_in: 1,
            raw_out: 2,
            billing_flow: 3,
        });

        assert!(!agg.take_batch().is_empty());
        assert!(agg.take_batch().is_empty());
    }

    #[test]
    fn record_touches_every_map() {
        let agg = TrafficAggregator::new();
        agg.record(TrafficSample {
            forward_id: 4,
            user_id: 2,
            grant: Some((2, 9)),
            node_id: 1,
            flow: FlowIncrement {
                raw_in: 100,
                raw_out: 200,
                billed_in: 0,
                billed_out: 400,
            },
            history: key(4),
        });

        let batch = agg.take_batch();
        assert_eq!(batch.forwards.len(), 1);
        assert_eq!(batch.users.len(), 1);
        assert_eq!(batch.user_tunnels[0].0, (2, 9));
        assert_eq!(batch.nodes[0].1.billed_out, 0);
        assert_eq!(batch.history[0].billing_flow, 400);
    }

    #[test]
    fn concurrent_ingest_and_swap_lose_nothing() {
        let agg = Arc::new(TrafficAggregator::new());
        let mut total = 0;

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.add_forward(1, raw(1));
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            total += agg
                .take_batch()
                .forwards
                .iter()
                .map(|(_, inc)| inc.raw_in)
                .sum::<i64>();
        }
        for w in writers {
            w.join().unwrap();
        }
        total += agg
            .take_batch()
            .forwards
            .iter()
            .map(|(_, inc)| inc.raw_in)
            .sum::<i64>();

        assert_eq!(total, 8000);
    }
}
