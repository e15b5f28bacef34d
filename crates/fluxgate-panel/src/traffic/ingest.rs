//! Report ingestion: a bounded queue in front of a single worker task.
//!
//! HTTP handlers only enqueue; the worker authenticates the node, opens the
//! envelope, attributes each report to a forward, applies billing, and feeds
//! the aggregator. Nothing here reports failure back to the agent.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fluxgate_crypto::{ChannelKey, open_envelope};
use fluxgate_proto::{ConfigReport, FlowReport, ServiceName};

use crate::limits::{EnforcementQueue, LimitCheck};
use crate::reconcile::Reconciler;
use crate::storage::{FLOW_EGRESS_ONLY, FlowIncrement, Node, PanelDatabase, Tunnel};

use super::aggregator::{HistoryKey, TrafficAggregator, TrafficSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Flow,
    Config,
}

/// One raw request body awaiting processing.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub kind: ReportKind,
    pub secret: String,
    pub body: Vec<u8>,
}

/// Producer side of the ingestion queue.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IngestJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full queue drops the job.
    pub fn submit(&self, job: IngestJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    kind = ?job.kind,
                    capacity = self.tx.max_capacity(),
                    "Ingestion queue full; report dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Ingestion queue closed; report dropped");
                false
            }
        }
    }
}

/// Raw bytes of a report as `(in, out)` from the panel's point of view.
///
/// Legacy agents name fields from the client's side, so `d` is what the
/// node took in. Versioned agents report both legs of the proxy.
pub const fn raw_bytes(report: &FlowReport) -> (i64, i64) {
    if report.version == 0 {
        (report.download, report.upload)
    } else {
        (
            report.upload + report.dial_upload,
            report.download + report.dial_download,
        )
    }
}

/// Apply the tunnel's ratio and direction mode to raw bytes.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn billed_bytes(raw_in: i64, raw_out: i64, tunnel: &Tunnel) -> (i64, i64) {
    let scale = |raw: i64| (raw as f64 * tunnel.traffic_ratio).floor() as i64;
    let billed_in = if tunnel.flow == FLOW_EGRESS_ONLY {
        0
    } else {
        scale(raw_in)
    };
    (billed_in, scale(raw_out))
}

/// Hour bucket label for the ledger.
pub fn hour_bucket(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:00:00").to_string()
}

pub struct IngestWorker {
    db: PanelDatabase,
    aggregator: Arc<TrafficAggregator>,
    limits: EnforcementQueue,
    reconciler: Arc<Reconciler>,
}

impl IngestWorker {
    pub const fn new(
        db: PanelDatabase,
        aggregator: Arc<TrafficAggregator>,
        limits: EnforcementQueue,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            db,
            aggregator,
            limits,
            reconciler,
        }
    }

    /// Process jobs until shutdown, then drain whatever is already queued.
    pub async fn run(self, mut rx: mpsc::Receiver<IngestJob>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(job) = rx.recv().await {
                        self.process(job).await;
                        drained += 1;
                    }
                    info!(drained, "Ingestion queue drained");
                    break;
                }
            }
        }
    }

    pub async fn process(&self, job: IngestJob) {
        let node = match self.db.get_node_by_secret(&job.secret).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(kind = ?job.kind, "Report with unknown node secret ignored");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to look up reporting node");
                return;
            }
        };

        let Some(payload) = decode_body(&node, &job.body) else {
            return;
        };

        match job.kind {
            ReportKind::Flow => match FlowReport::parse_batch(&payload) {
                Ok(reports) => {
                    let now = Local::now();
                    for report in &reports {
                        self.process_flow(node.id, report, &now).await;
                    }
                }
                Err(e) => warn!(node_id = node.id, error = %e, "Malformed traffic report"),
            },
            ReportKind::Config => match serde_json::from_slice::<ConfigReport>(&payload) {
                Ok(report) => {
                    self.reconciler.on_config_report(node.id, &report).await;
                }
                Err(e) => warn!(node_id = node.id, error = %e, "Malformed config report"),
            },
        }
    }

    /// Attribute one report to its forward and feed the aggregator.
    pub async fn process_flow(&self, node_id: i64, report: &FlowReport, now: &DateTime<Local>) {
        if report.is_management() {
            return;
        }
        let name: ServiceName = match report.name.parse() {
            Ok(name) => name,
            Err(e) => {
                warn!(node_id, error = %e, "Dropping report with malformed service name");
                return;
            }
        };

        let forward = match self.db.get_forward(name.forward_id).await {
            Ok(forward) => forward,
            Err(e) => {
                debug!(node_id, forward_id = name.forward_id, error = %e, "Report for unknown forward");
                return;
            }
        };
        let tunnel = match self.db.get_tunnel(forward.tunnel_id).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(forward_id = forward.id, error = %e, "Forward references missing tunnel");
                return;
            }
        };

        let (raw_in, raw_out) = raw_bytes(report);
        let (billed_in, billed_out) = billed_bytes(raw_in, raw_out, &tunnel);
        let grant = name
            .has_grant()
            .then_some((forward.user_id, forward.tunnel_id));

        self.aggregator.record(TrafficSample {
            forward_id: forward.id,
            user_id: forward.user_id,
            grant,
            node_id,
            flow: FlowIncrement {
                raw_in,
                raw_out,
                billed_in,
                billed_out,
            },
            history: HistoryKey {
                hour: hour_bucket(now),
                node_id,
                forward_id: forward.id,
                user_id: forward.user_id,
                tunnel_id: tunnel.id,
            },
        });

        self.limits.schedule(LimitCheck::User(forward.user_id));
        if name.has_grant() {
            self.limits.schedule(LimitCheck::Grant {
                user_id: forward.user_id,
                tunnel_id: forward.tunnel_id,
            });
        }
    }
}

/// Open the envelope (if any) and unwrap a JSON-string-wrapped body.
fn decode_body(node: &Node, body: &[u8]) -> Option<Vec<u8>> {
    let key = ChannelKey::derive(&node.secret);
    let payload = match open_envelope(Some(&key), body) {
        Ok(opened) => opened.into_bytes(),
        Err(e) => {
            warn!(node_id = node.id, error = %e, "Dropping report that failed to open");
            return None;
        }
    };
    match serde_json::from_slice::<serde_json::Value>(&payload) {
        Ok(serde_json::Value::String(inner)) => Some(inner.into_bytes()),
        _ => Some(payload),
    }
}
