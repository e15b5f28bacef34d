//! HTTP and WebSocket surface.
//!
//! - `GET /system-info` (and `/api/v1/system-info`): node and observer WebSockets
//! - `POST /flow/upload`, `POST /flow/config`: agent report ingestion
//! - `/flow/test`: liveness probe for agents

mod ingest;
mod ws;

#[cfg(test)]
mod ws_tests;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get, post};
use tokio::sync::watch;

use crate::auth::TokenVerifier;
use crate::reconcile::Reconciler;
use crate::registry::SessionRegistry;
use crate::router::RpcCorrelator;
use crate::storage::PanelDatabase;
use crate::traffic::IngestQueue;

pub use ingest::SecretQuery;
pub use ws::{ConnectParams, FrameOutcome, handle_node_frame};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: PanelDatabase,
    pub registry: Arc<SessionRegistry>,
    pub correlator: Arc<RpcCorrelator>,
    pub reconciler: Arc<Reconciler>,
    pub ingest: IngestQueue,
    pub verifier: TokenVerifier,
    /// Outbound frame buffer per connection.
    pub outbound_buffer: usize,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/system-info", get(ws::connect))
        .route("/api/v1/system-info", get(ws::connect))
        .route("/flow/upload", post(ingest::upload))
        .route("/flow/config", post(ingest::config))
        .route("/flow/test", any(ingest::test))
        .with_state(state)
}
