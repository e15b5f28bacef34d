//! Report ingestion endpoints.
//!
//! Every request is answered `ok` once it has been queued (or dropped);
//! processing happens on the ingestion worker.

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::Deserialize;
use tracing::debug;

use crate::traffic::{IngestJob, ReportKind};

use super::AppState;

const ACCEPTED: &str = "ok";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SecretQuery {
    pub secret: String,
}

fn enqueue(
    state: &AppState,
    kind: ReportKind,
    query: Result<Query<SecretQuery>, QueryRejection>,
    body: Bytes,
) -> &'static str {
    let secret = match query {
        Ok(Query(q)) => q.secret,
        Err(e) => {
            debug!(error = %e, "Report with unreadable query ignored");
            return ACCEPTED;
        }
    };
    state.ingest.submit(IngestJob {
        kind,
        secret,
        body: body.to_vec(),
    });
    ACCEPTED
}

/// `POST /flow/upload?secret=`
pub async fn upload(
    State(state): State<AppState>,
    query: Result<Query<SecretQuery>, QueryRejection>,
    body: Bytes,
) -> &'static str {
    enqueue(&state, ReportKind::Flow, query, body)
}

/// `POST /flow/config?secret=`
pub async fn config(
    State(state): State<AppState>,
    query: Result<Query<SecretQuery>, QueryRejection>,
    body: Bytes,
) -> &'static str {
    enqueue(&state, ReportKind::Config, query, body)
}

/// `/flow/test`
pub async fn test() -> &'static str {
    "test"
}
