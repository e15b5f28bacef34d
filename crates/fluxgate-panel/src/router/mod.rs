//! RPC to agents: correlated calls and the seam orchestration depends on.

mod correlator;

use async_trait::async_trait;

use fluxgate_proto::{AgentReply, Command};

pub use correlator::RpcCorrelator;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("node is offline (node {0})")]
    Offline(i64),

    #[error("Timed out waiting for node {node_id} (request {request_id}); outcome unknown")]
    Timeout { node_id: i64, request_id: String },

    #[error("{0}")]
    Rejected(String),

    #[error("Failed to send to node: {0}")]
    SendFailed(String),

    #[error("Failed to encode command: {0}")]
    Encode(String),

    #[error("Response channel dropped: {0}")]
    ResponseDropped(String),
}

impl RpcError {
    /// The agent reported it has no artifact by that name.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected(msg) if msg.to_ascii_lowercase().contains("not found"))
    }

    /// The remote side may or may not have applied the command.
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ResponseDropped(_))
    }
}

/// Calls into remote agents.
#[async_trait]
pub trait AgentRpc: Send + Sync {
    /// Send `command` to `node_id` and return the agent's reply as-is.
    async fn call(&self, node_id: i64, command: Command) -> Result<AgentReply, RpcError>;

    /// Like `call`, but a non-OK reply becomes `RpcError::Rejected`.
    async fn execute(&self, node_id: i64, command: Command) -> Result<AgentReply, RpcError> {
        let reply = self.call(node_id, command).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(RpcError::Rejected(reply.message))
        }
    }
}
