//! WebSocket sessions for nodes and observers.
//!
//! Credentials are checked before the upgrade so a rejected peer gets a
//! plain 401. Each connection gets one writer task owning the sink; the
//! read loop only decrypts, routes, and broadcasts, so it never waits on a
//! pending RPC.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fluxgate_crypto::{ChannelKey, open_envelope};
use fluxgate_proto::{CommandFrame, ObserverEvent};

use crate::auth::Claims;
use crate::registry::{NodeRuntime, NodeSession, SendError};
use crate::storage::Node;

use super::AppState;

/// `type` value identifying a node; anything else is an observer.
const NODE_ROLE: &str = "1";

/// Field present in the periodic system info a node pushes.
const HEARTBEAT_MARKER: &[u8] = b"memory_usage";

/// Query parameters of a connection request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    #[serde(rename = "type")]
    pub role: String,
    pub secret: String,
    pub version: Option<String>,
    pub http: Option<String>,
    pub tls: Option<String>,
    pub socks: Option<String>,
}

/// A protocol flag as sent by the agent; blank or malformed means unreported.
fn reported_flag(value: Option<&str>) -> Option<i64> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

impl ConnectParams {
    fn is_node(&self) -> bool {
        self.role == NODE_ROLE
    }

    pub(crate) fn runtime(&self) -> NodeRuntime {
        NodeRuntime {
            version: self.version.clone().filter(|v| !v.is_empty()),
            http: reported_flag(self.http.as_deref()),
            tls: reported_flag(self.tls.as_deref()),
            socks: reported_flag(self.socks.as_deref()),
        }
    }
}

enum Peer {
    Node(Node),
    Observer(Claims),
}

async fn authenticate(state: &AppState, params: &ConnectParams) -> Result<Peer, StatusCode> {
    if params.is_node() {
        return match state.db.get_node_by_secret(&params.secret).await {
            Ok(Some(node)) => Ok(Peer::Node(node)),
            Ok(None) => {
                warn!("Rejected node connection with unknown secret");
                Err(StatusCode::UNAUTHORIZED)
            }
            Err(e) => {
                warn!(error = %e, "Failed to look up connecting node");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
    }
    state
        .verifier
        .verify(&params.secret)
        .map(Peer::Observer)
        .map_err(|e| {
            debug!(error = %e, "Rejected observer token");
            StatusCode::UNAUTHORIZED
        })
}

/// `GET /system-info`
pub async fn connect(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = match authenticate(&state, &params).await {
        Ok(peer) => peer,
        Err(status) => return status.into_response(),
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    match peer {
        Peer::Node(node) => {
            let runtime = params.runtime();
            ws.on_upgrade(move |socket| run_node(socket, state, node, runtime))
        }
        Peer::Observer(claims) => ws.on_upgrade(move |socket| run_observer(socket, state, claims)),
    }
}

/// What became of one inbound node frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Consumed as a reply to a correlated call.
    Reply,
    /// Broadcast to observers as node info.
    Telemetry,
    /// Failed to open; nothing was done with it.
    Rejected,
}

fn acknowledge_heartbeat(session: &NodeSession) -> Result<(), SendError> {
    let ack = serde_json::to_vec(&CommandFrame::heartbeat_ack()).map_err(|e| SendError::Seal {
        node_id: session.node_id,
        source: e.into(),
    })?;
    session.try_send(&ack)
}

/// Route one inbound frame from a node.
pub async fn handle_node_frame(state: &AppState, session: &NodeSession, raw: &[u8]) -> FrameOutcome {
    let node_id = session.node_id;
    let payload = match open_envelope(Some(session.key()), raw) {
        Ok(opened) => opened.into_bytes(),
        Err(e) => {
            warn!(node_id, error = %e, "Dropping frame that failed to open");
            return FrameOutcome::Rejected;
        }
    };

    if state.correlator.dispatch_reply(node_id, &payload) {
        return FrameOutcome::Reply;
    }

    if payload
        .windows(HEARTBEAT_MARKER.len())
        .any(|w| w == HEARTBEAT_MARKER)
    {
        // Never waits on the writer; a full queue drops the ack.
        if let Err(e) = acknowledge_heartbeat(session) {
            debug!(node_id, error = %e, "Heartbeat acknowledgement not sent");
        }
    }
    state
        .registry
        .broadcast(&ObserverEvent::info(node_id, &payload))
        .await;
    FrameOutcome::Telemetry
}

async fn run_node(socket: WebSocket, state: AppState, node: Node, runtime: NodeRuntime) {
    let node_id = node.id;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.outbound_buffer.max(1));

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = state
        .registry
        .register_node(node_id, ChannelKey::derive(&node.secret), tx, runtime)
        .await;

    let reconciler = Arc::clone(&state.reconciler);
    tokio::spawn(async move {
        reconciler.on_node_connected(node_id).await;
    });

    let mut shutdown = state.shutdown.clone();
    {
        let closed = session.closed();
        tokio::pin!(closed);
        loop {
            tokio::select! {
                () = &mut closed => {
                    info!(node_id, "Node session closed by registry");
                    break;
                }
                _ = shutdown.changed() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_node_frame(&state, &session, text.as_str().as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_node_frame(&state, &session, &bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(node_id, error = %e, "Node socket read failed");
                        break;
                    }
                },
            }
        }
    }

    state.registry.unregister_node(&session).await;
    drop(session);
    let _ = writer.await;
    info!(node_id, "Node disconnected");
}

async fn run_observer(socket: WebSocket, state: AppState, claims: Claims) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.outbound_buffer.max(1));
    let id = state.registry.register_observer(tx).await;
    info!(observer = id, operator = %claims.sub, "Observer connected");

    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => break,
        }
    }

    state.registry.unregister_observer(id).await;
    let _ = sink.close().await;
    info!(observer = id, "Observer disconnected");
}
