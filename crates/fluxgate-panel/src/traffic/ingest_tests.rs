//! Ingestion worker tests: attribution, billing, envelopes, queueing.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;

use fluxgate_crypto::{ChannelKey, seal_envelope};
use fluxgate_proto::FlowReport;

use super::aggregator::TrafficAggregator;
use super::ingest::{IngestJob, IngestQueue, IngestWorker, ReportKind, billed_bytes, raw_bytes};
use crate::limits::{EnforcementQueue, EnforcementReceiver, LimitCheck};
use crate::orchestrator::ForwardRequest;
use crate::orchestrator::test_helpers::Fixture;
use crate::reconcile::Reconciler;
use crate::storage::{FlowIncrement, Forward, Tunnel};

fn tunnel(flow: i64, traffic_ratio: f64) -> Tunnel {
    Tunnel {
        id: 1,
        name: "t".into(),
        status: 1,
        flow,
        traffic_ratio,
        tcp_listen_addr: "[::]".into(),
        udp_listen_addr: "[::]".into(),
        interface_name: String::new(),
        created_at: 0,
        updated_at: 0,
    }
}

#[test]
fn billing_applies_ratio_and_direction_mode() {
    assert_eq!(billed_bytes(100, 200, &tunnel(1, 2.0)), (0, 400));
    assert_eq!(billed_bytes(100, 200, &tunnel(2, 2.0)), (200, 400));
    assert_eq!(billed_bytes(3, 3, &tunnel(2, 0.5)), (1, 1));
}

#[test]
fn legacy_and_versioned_reports_map_differently() {
    let legacy = FlowReport {
        name: "1_1_0".into(),
        upload: 10,
        download: 20,
        ..FlowReport::default()
    };
    assert_eq!(raw_bytes(&legacy), (20, 10));

    let versioned = FlowReport {
        name: "1_1_0".into(),
        upload: 10,
        download: 20,
        dial_upload: 1,
        dial_download: 2,
        version: 1,
    };
    assert_eq!(raw_bytes(&versioned), (11, 22));
}

#[test]
fn full_queue_drops_job() {
    let (queue, _rx) = IngestQueue::channel(1);
    let job = IngestJob {
        kind: ReportKind::Flow,
        secret: "s".into(),
        body: b"{}".to_vec(),
    };
    assert!(queue.submit(job.clone()));
    assert!(!queue.submit(job));
}

struct Harness {
    fx: Fixture,
    secret: String,
    node_id: i64,
    forward: Forward,
    grant_id: i64,
    aggregator: Arc<TrafficAggregator>,
    checks: EnforcementReceiver,
    worker: IngestWorker,
}

impl Harness {
    async fn new() -> Self {
        let fx = Fixture::new().await;
        let node_id = fx.node("edge", "10.0.0.1", "10000-10010").await;
        let stored = fx.tunnel(&[(node_id, None)]).await;
        let grant_id = fx.grant(stored.id).await.id;
        let forward = fx
            .orch
            .create_forward(&ForwardRequest {
                user_id: fx.user.id,
                name: "web".into(),
                tunnel_id: stored.id,
                in_port: None,
                remote_addr: "192.0.2.10:443".into(),
                strategy: String::new(),
                interface_name: String::new(),
            })
            .await
            .unwrap();

        let aggregator = Arc::new(TrafficAggregator::new());
        let (limits, checks) = EnforcementQueue::channel(16);
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&fx.orch)));
        let worker = IngestWorker::new(fx.db.clone(), Arc::clone(&aggregator), limits, reconciler);
        Self {
            secret: "secret-edge".into(),
            fx,
            node_id,
            forward,
            grant_id,
            aggregator,
            checks,
            worker,
        }
    }

    fn service(&self) -> String {
        format!("{}_{}_{}_tcp", self.forward.id, self.fx.user.id, self.grant_id)
    }

    async fn submit(&self, body: Vec<u8>) {
        self.worker
            .process(IngestJob {
                kind: ReportKind::Flow,
                secret: self.secret.clone(),
                body,
            })
            .await;
    }
}

#[tokio::test]
async fn plaintext_report_feeds_aggregator_and_schedules_checks() {
    let mut h = Harness::new().await;
    let body = json!([{"n": h.service(), "u": 100, "d": 300, "v": 0}]);
    h.submit(body.to_string().into_bytes()).await;

    let batch = h.aggregator.take_batch();
    assert_eq!(
        batch.forwards,
        vec![(
            h.forward.id,
            FlowIncrement {
                raw_in: 300,
                raw_out: 100,
                billed_in: 300,
                billed_out: 100,
            }
        )]
    );
    assert_eq!(batch.user_tunnels[0].0, (h.fx.user.id, h.forward.tunnel_id));
    assert_eq!(batch.nodes[0].0, h.node_id);
    assert_eq!(batch.history[0].forward_id, h.forward.id);
    assert_eq!(batch.history[0].billing_flow, 400);

    assert_eq!(h.checks.recv().await, Some(LimitCheck::User(h.fx.user.id)));
    assert_eq!(
        h.checks.recv().await,
        Some(LimitCheck::Grant {
            user_id: h.fx.user.id,
            tunnel_id: h.forward.tunnel_id,
        })
    );
}

#[tokio::test]
async fn sealed_and_string_wrapped_bodies_are_opened() {
    let h = Harness::new().await;
    let report = json!({"n": h.service(), "u": 5, "d": 7, "du": 1, "dd": 2, "v": 1}).to_string();

    let sealed = seal_envelope(&ChannelKey::derive(&h.secret), report.as_bytes()).unwrap();
    h.submit(sealed.into_bytes()).await;
    let wrapped = serde_json::to_string(&report).unwrap();
    h.submit(wrapped.into_bytes()).await;

    let batch = h.aggregator.take_batch();
    let (_, flow) = batch.forwards[0];
    assert_eq!((flow.raw_in, flow.raw_out), (12, 18));
}

#[tokio::test]
async fn unattributable_reports_are_dropped() {
    let h = Harness::new().await;
    let bodies = [
        json!({"n": "web_api", "u": 1, "d": 1}),
        json!({"n": "not-a-service", "u": 1, "d": 1}),
        json!({"n": "9999_1_0_tcp", "u": 1, "d": 1}),
    ];
    for body in bodies {
        h.submit(body.to_string().into_bytes()).await;
    }
    h.submit(b"not json".to_vec()).await;

    let stranger = json!({"n": h.service(), "u": 1, "d": 1}).to_string();
    h.worker
        .process(IngestJob {
            kind: ReportKind::Flow,
            secret: "unknown".into(),
            body: stranger.into_bytes(),
        })
        .await;

    assert!(h.aggregator.take_batch().is_empty());
    assert_eq!(h.checks.queued(), 0);
}

#[tokio::test]
async fn foreign_key_envelope_fails_closed() {
    let h = Harness::new().await;
    let report = json!({"n": h.service(), "u": 5, "d": 7}).to_string();
    let sealed = seal_envelope(&ChannelKey::derive("other-secret"), report.as_bytes()).unwrap();
    h.submit(sealed.into_bytes()).await;
    assert!(h.aggregator.take_batch().is_empty());
}

#[tokio::test]
async fn config_report_reaches_reconciler() {
    let h = Harness::new().await;
    h.fx.orch.pause_forward(h.forward.id).await.unwrap();
    h.fx.rpc.clear();

    let body = json!({"services": [{"name": h.service(), "addr": ":10000"}]}).to_string();
    h.worker
        .process(IngestJob {
            kind: ReportKind::Config,
            secret: h.secret.clone(),
            body: body.into_bytes(),
        })
        .await;
    assert_eq!(h.fx.rpc.trace(), vec![("PauseService", h.node_id)]);
}
