//! Errors surfaced to administrative callers.

use crate::alloc::{PortError, SelfLoop};
use crate::limits::Violation;
use crate::router::RpcError;
use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// A remote step failed; earlier steps were rolled back.
    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: RpcError,
    },

    /// The operation left remote state needing operator attention.
    #[error("{0}")]
    Recovery(String),
}

impl OrchestrationError {
    /// The RPC failure behind a failed step.
    pub const fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Step { source, .. } => Some(source),
            Self::Recovery(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Forward {0} not found")]
    NotFound(i64),

    #[error("Tunnel {0} not found")]
    TunnelNotFound(i64),

    #[error("Tunnel {0} is disabled")]
    TunnelDisabled(i64),

    #[error("User {user_id}: {violation}")]
    UserDenied { user_id: i64, violation: Violation },

    #[error("User {user_id} has no access to tunnel {tunnel_id}")]
    NoGrant { user_id: i64, tunnel_id: i64 },

    #[error("Access of user {user_id} to tunnel {tunnel_id}: {violation}")]
    GrantDenied {
        user_id: i64,
        tunnel_id: i64,
        violation: Violation,
    },

    #[error("Forward limit of {limit} reached")]
    ForwardLimit { limit: i64 },

    #[error("Forward {0} has no exit port on a multi-hop tunnel")]
    MissingExitPort(i64),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    SelfLoop(#[from] SelfLoop),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel {0} not found")]
    NotFound(i64),

    #[error("A tunnel needs at least one hop")]
    NoHops,

    #[error("Node {0} not found")]
    NodeNotFound(i64),

    #[error("Tunnel {tunnel_id} is still used by {forwards} forwards and {grants} user grants")]
    InUse {
        tunnel_id: i64,
        forwards: i64,
        grants: i64,
    },

    #[error("Speed limit {0} not found")]
    SpeedLimitNotFound(i64),

    #[error("Invalid speed {0} Mbps")]
    InvalidSpeed(i64),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// Map a storage miss to a domain error, passing other failures through.
pub(super) fn not_found_as<E: From<DatabaseError>>(
    err: DatabaseError,
    missing: impl FnOnce() -> E,
) -> E {
    match err {
        DatabaseError::NotFound(_) => missing(),
        other => E::from(other),
    }
}
