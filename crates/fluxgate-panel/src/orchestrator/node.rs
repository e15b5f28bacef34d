//! Protocols a node exposes on its own management listener.

use fluxgate_proto::{Command, ProtocolFlags};
use tracing::info;

use crate::storage::{NODE_ONLINE, Node};

use super::Orchestrator;
use super::error::{NodeError, OrchestrationError, not_found_as};

/// Flags as stored for `node`.
pub(crate) const fn stored_protocol(node: &Node) -> ProtocolFlags {
    ProtocolFlags {
        http: node.http,
        tls: node.tls,
        socks: node.socks,
    }
}

impl Orchestrator {
    async fn node_or_missing(&self, node_id: i64) -> Result<Node, NodeError> {
        self.db
            .get_node(node_id)
            .await
            .map_err(|e| not_found_as(e, || NodeError::NotFound(node_id)))
    }

    async fn push_protocol(&self, node_id: i64, flags: ProtocolFlags) -> Result<(), NodeError> {
        self.rpc()
            .execute(node_id, Command::SetProtocol(flags))
            .await
            .map_err(|source| OrchestrationError::Step {
                step: format!("set protocols on node {node_id}"),
                source,
            })?;
        Ok(())
    }

    /// Change which protocols a node exposes.
    ///
    /// An online node must accept the change before it is stored. An offline
    /// node only gets it stored; it is pushed when the node reconnects.
    pub async fn set_node_protocol(&self, node_id: i64, flags: ProtocolFlags) -> Result<Node, NodeError> {
        let node = self.node_or_missing(node_id).await?;
        if stored_protocol(&node) == flags {
            return Ok(node);
        }
        if node.status == NODE_ONLINE {
            self.push_protocol(node_id, flags).await?;
        }
        self.db
            .set_node_protocol(node_id, flags.http, flags.tls, flags.socks)
            .await
            .map_err(|e| not_found_as(e, || NodeError::NotFound(node_id)))?;
        info!(node_id, http = flags.http, tls = flags.tls, socks = flags.socks, "Node protocols updated");
        self.node_or_missing(node_id).await
    }

    /// Push the stored protocols to a node that just connected.
    pub(crate) async fn restore_node_protocol(&self, node_id: i64) -> Result<(), NodeError> {
        let node = self.node_or_missing(node_id).await?;
        self.push_protocol(node_id, stored_protocol(&node)).await
    }
}
