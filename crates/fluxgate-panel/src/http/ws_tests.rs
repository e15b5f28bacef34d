//! Inbound node frame routing.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::http::Uri;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use fluxgate_crypto::{ChannelKey, open_envelope, seal_envelope};
use fluxgate_proto::service::LimiterRef;
use fluxgate_proto::{Command, CommandFrame, ObserverEvent};

use super::{AppState, ConnectParams, FrameOutcome, handle_node_frame};
use crate::auth::TokenVerifier;
use crate::orchestrator::Orchestrator;
use crate::reconcile::Reconciler;
use crate::registry::{NodeRuntime, NodeSession, SessionRegistry};
use crate::router::{AgentRpc, RpcCorrelator};
use crate::storage::{NewNode, PanelDatabase};
use crate::traffic::IngestQueue;

const SECRET: &str = "edge-secret";

struct Harness {
    state: AppState,
    session: Arc<NodeSession>,
    outbound: mpsc::Receiver<String>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn new() -> Self {
        let db = PanelDatabase::open_in_memory().await.unwrap();
        let node = db
            .create_node(&NewNode {
                name: "edge",
                secret: SECRET,
                entry_ips: "",
                server_ip: "10.0.0.1",
                port_ranges: "",
            })
            .await
            .unwrap();
        let registry = Arc::new(SessionRegistry::new(db.clone()));
        let correlator = Arc::new(RpcCorrelator::new(
            Arc::clone(&registry),
            Duration::from_secs(2),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            Arc::clone(&correlator) as Arc<dyn AgentRpc>,
        ));
        let (ingest, _jobs) = IngestQueue::channel(4);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let (tx, outbound) = mpsc::channel(16);
        let session = registry
            .register_node(node.id, ChannelKey::derive(SECRET), tx, NodeRuntime::default())
            .await;

        Self {
            state: AppState {
                db,
                registry,
                correlator,
                reconciler: Arc::new(Reconciler::new(orchestrator)),
                ingest,
                verifier: TokenVerifier::new(b"observer-secret"),
                outbound_buffer: 16,
                shutdown,
            },
            session,
            outbound,
            _shutdown: shutdown_tx,
        }
    }

    async fn feed(&self, raw: &[u8]) -> FrameOutcome {
        handle_node_frame(&self.state, &self.session, raw).await
    }

    async fn next_outbound(&mut self) -> CommandFrame {
        let text = self.outbound.recv().await.unwrap();
        let payload = open_envelope(Some(&ChannelKey::derive(SECRET)), text.as_bytes())
            .unwrap()
            .into_bytes();
        serde_json::from_slice(&payload).unwrap()
    }
}

#[tokio::test]
async fn sealed_reply_resolves_pending_call() {
    let mut h = Harness::new().await;
    let correlator = Arc::clone(&h.state.correlator);
    let node_id = h.session.node_id;
    let call = tokio::spawn(async move {
        correlator
            .call(
                node_id,
                &Command::DeleteLimiters(LimiterRef {
                    limiter: "7".into(),
                }),
            )
            .await
    });

    let frame = h.next_outbound().await;
    assert_eq!(frame.kind, "DeleteLimiters");
    let reply = json!({"message": "OK", "requestId": frame.request_id});
    let sealed = seal_envelope(&ChannelKey::derive(SECRET), reply.to_string().as_bytes()).unwrap();

    assert_eq!(h.feed(sealed.as_bytes()).await, FrameOutcome::Reply);
    assert!(call.await.unwrap().unwrap().is_ok());
    assert_eq!(h.state.correlator.pending_count(), 0);
}

#[tokio::test]
async fn heartbeat_is_acknowledged_then_broadcast() {
    let mut h = Harness::new().await;
    let (obs_tx, mut obs_rx) = mpsc::channel(8);
    h.state.registry.register_observer(obs_tx).await;

    let info = br#"{"memory_usage": 41.5, "cpu_usage": 3}"#;
    assert_eq!(h.feed(info).await, FrameOutcome::Telemetry);

    let ack = h.next_outbound().await;
    assert_eq!(ack, CommandFrame::heartbeat_ack());

    let event: ObserverEvent = serde_json::from_str(&obs_rx.recv().await.unwrap()).unwrap();
    assert_eq!(event, ObserverEvent::info(h.session.node_id, info));
}

#[tokio::test]
async fn plain_status_is_broadcast_without_ack() {
    let mut h = Harness::new().await;
    let (obs_tx, mut obs_rx) = mpsc::channel(8);
    h.state.registry.register_observer(obs_tx).await;

    assert_eq!(h.feed(br#"{"uptime": 10}"#).await, FrameOutcome::Telemetry);
    assert!(obs_rx.recv().await.is_some());
    assert!(h.outbound.try_recv().is_err());
}

#[tokio::test]
async fn frame_sealed_with_another_key_is_rejected() {
    let h = Harness::new().await;
    let (obs_tx, mut obs_rx) = mpsc::channel(8);
    h.state.registry.register_observer(obs_tx).await;

    let sealed = seal_envelope(&ChannelKey::derive("intruder"), br#"{"memory_usage": 1}"#).unwrap();
    assert_eq!(h.feed(sealed.as_bytes()).await, FrameOutcome::Rejected);
    assert!(obs_rx.try_recv().is_err());
}

#[tokio::test]
async fn full_outbound_queue_does_not_stall_the_read_loop() {
    let h = Harness::new().await;
    for _ in 0..h.state.outbound_buffer {
        h.session.send(b"{}").await.unwrap();
    }

    let heartbeat = tokio::time::timeout(
        Duration::from_secs(1),
        h.feed(br#"{"memory_usage": 99.0}"#),
    )
    .await
    .unwrap();
    assert_eq!(heartbeat, FrameOutcome::Telemetry);

    let reply = json!({"message": "OK", "requestId": "late-1"}).to_string();
    let outcome = tokio::time::timeout(Duration::from_secs(1), h.feed(reply.as_bytes()))
        .await
        .unwrap();
    assert_eq!(outcome, FrameOutcome::Reply);
}

fn handshake(query: &str) -> NodeRuntime {
    let uri: Uri = format!("/system-info?{query}").parse().unwrap();
    let Query(params) = Query::<ConnectParams>::try_from_uri(&uri).unwrap();
    params.runtime()
}

#[test]
fn handshake_flags_are_optional() {
    assert_eq!(
        handshake("type=1&secret=s&version=2.1.0&http=1&tls=0&socks=1"),
        NodeRuntime {
            version: Some("2.1.0".into()),
            http: Some(1),
            tls: Some(0),
            socks: Some(1),
        }
    );
    assert_eq!(handshake("type=1&secret=s"), NodeRuntime::default());
    assert_eq!(
        handshake("type=1&secret=s&version=&http=&tls=%20&socks=yes"),
        NodeRuntime::default()
    );
}
