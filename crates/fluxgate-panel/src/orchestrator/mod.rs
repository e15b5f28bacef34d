//! Administrative orchestration of forwards, tunnels, speed limits, and
//! node protocol settings.
//!
//! Every operation validates locally first (admission, ports, self-loop),
//! then drives ordered remote steps through [`AgentRpc`], rolling back what
//! it already applied when a later step fails.

mod descriptors;
mod error;
mod forward;
mod limiter;
mod node;
mod steps;
mod tunnel;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;

use fluxgate_proto::Command;
use fluxgate_proto::service::TcpPingRequest;

use crate::alloc::{PortAllocator, split_host_port};
use crate::router::AgentRpc;
use crate::storage::{DatabaseError, Node, PanelDatabase, Tunnel, TunnelNode};

pub use descriptors::{ForwardPlan, PlanHop, Segment, Upsert, tunnel_relay_service};
pub use error::{ForwardError, NodeError, OrchestrationError, TunnelError};
pub use forward::ForwardRequest;
pub use steps::{Step, rollback, run_steps};
pub use tunnel::{HopRequest, TunnelRequest};

use error::not_found_as;

/// Outcome of one reachability probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub from_node: i64,
    pub target: String,
    /// The agent's ping data, or why the probe could not run.
    pub outcome: Result<serde_json::Value, String>,
}

impl ProbeResult {
    pub const fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A tunnel with its ordered hops and the nodes hosting them.
///
/// Only built by [`Orchestrator::load_route`], which refuses a tunnel
/// without hops, so there is always an entry node.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub tunnel: Tunnel,
    pub hops: Vec<TunnelNode>,
    entry: Node,
    downstream: Vec<Node>,
}

impl Route {
    pub const fn entry(&self) -> &Node {
        &self.entry
    }

    /// Nodes after the entry, in hop order.
    pub fn downstream(&self) -> &[Node] {
        &self.downstream
    }

    /// Exit node of a multi-hop tunnel.
    pub fn exit(&self) -> Option<&Node> {
        self.downstream.last()
    }

    /// Last node of the chain: the exit, or the entry of a single hop.
    pub fn last(&self) -> &Node {
        self.exit().unwrap_or(&self.entry)
    }

    /// Nodes whose port pools a forward on this route draws from.
    pub fn port_nodes(&self) -> Vec<i64> {
        let mut ids = vec![self.entry.id];
        ids.extend(self.exit().map(|n| n.id));
        ids
    }

    pub fn plan_hops(&self) -> Vec<PlanHop> {
        let nodes = std::iter::once(&self.entry).chain(&self.downstream);
        self.hops
            .iter()
            .zip(nodes)
            .map(|(hop, node)| PlanHop::new(hop, node))
            .collect()
    }
}

pub struct Orchestrator {
    db: PanelDatabase,
    rpc: Arc<dyn AgentRpc>,
    ports: PortAllocator,
}

impl Orchestrator {
    pub fn new(db: PanelDatabase, rpc: Arc<dyn AgentRpc>) -> Self {
        Self {
            ports: PortAllocator::new(db.clone()),
            db,
            rpc,
        }
    }

    pub const fn db(&self) -> &PanelDatabase {
        &self.db
    }

    fn rpc(&self) -> &dyn AgentRpc {
        self.rpc.as_ref()
    }

    /// Load a tunnel with its hops and their nodes.
    pub(crate) async fn load_route(&self, tunnel_id: i64) -> Result<Route, DatabaseError> {
        let tunnel = self.db.get_tunnel(tunnel_id).await?;
        let hops = self.db.get_tunnel_hops(tunnel_id).await?;
        let mut nodes = Vec::with_capacity(hops.len());
        for hop in &hops {
            nodes.push(self.db.get_node(hop.node_id).await?);
        }
        let mut nodes = nodes.into_iter();
        let entry = nodes
            .next()
            .ok_or_else(|| DatabaseError::NotFound(format!("Entry hop of tunnel {tunnel_id}")))?;
        Ok(Route {
            tunnel,
            hops,
            entry,
            downstream: nodes.collect(),
        })
    }

    /// Ask `from_node` to TCP-ping `target` (`host:port`).
    async fn probe(&self, from_node: i64, target: &str) -> ProbeResult {
        let outcome = match split_host_port(target) {
            (host, Some(port)) if !host.is_empty() => {
                let command = Command::TcpPing(TcpPingRequest::new(host, port));
                self.rpc()
                    .execute(from_node, command)
                    .await
                    .map(|reply| reply.data)
                    .map_err(|e| e.to_string())
            }
            _ => Err(format!("`{target}` has no port")),
        };
        ProbeResult {
            from_node,
            target: target.to_string(),
            outcome,
        }
    }
}

/// Map a missing tunnel to the forward error naming it.
fn tunnel_missing(tunnel_id: i64) -> impl FnOnce(DatabaseError) -> ForwardError {
    move |e| not_found_as(e, || ForwardError::TunnelNotFound(tunnel_id))
}
