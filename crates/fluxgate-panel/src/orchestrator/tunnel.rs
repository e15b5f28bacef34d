//! Tunnel lifecycle: create with relay listeners, guarded delete, diagnose.

use std::collections::{BTreeSet, HashMap};

use fluxgate_proto::Command;
use fluxgate_proto::service::LimiterRef;
use tracing::{info, warn};

use crate::alloc::PortWish;
use crate::storage::{NewHop, NewTunnel, Node, PortExclusion, Tunnel};

use super::descriptors::{remove_tunnel_relay, tunnel_relay_service};
use super::error::{TunnelError, not_found_as};
use super::steps::{Step, remove, run_steps};
use super::{Orchestrator, ProbeResult};

#[derive(Debug, Clone)]
pub struct HopRequest {
    pub node_id: i64,
    /// Relay port for non-entry hops; the lowest free port when unset.
    pub port: Option<u16>,
    /// Protocol this hop dials the next one with.
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub name: String,
    /// 1 = egress only, 2 = both directions.
    pub flow: i64,
    pub traffic_ratio: f64,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: String,
    /// Ordered hops, entry first.
    pub hops: Vec<HopRequest>,
}

impl Orchestrator {
    /// Create a tunnel and push its relay listeners, tail first so every
    /// listener exists before anything dials it.
    pub async fn create_tunnel(&self, req: &TunnelRequest) -> Result<Tunnel, TunnelError> {
        if req.hops.is_empty() {
            return Err(TunnelError::NoHops);
        }
        let mut nodes: Vec<Node> = Vec::with_capacity(req.hops.len());
        for hop in &req.hops {
            let node = self
                .db
                .get_node(hop.node_id)
                .await
                .map_err(|e| not_found_as(e, || TunnelError::NodeNotFound(hop.node_id)))?;
            nodes.push(node);
        }

        let node_ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
        let lease = self.ports.lease(&node_ids).await;
        let mut reserved: HashMap<i64, BTreeSet<u16>> = HashMap::new();
        let mut hops = Vec::with_capacity(req.hops.len());
        for (position, (hop, node)) in req.hops.iter().zip(&nodes).enumerate() {
            let port = if position == 0 {
                None
            } else {
                let taken = reserved.entry(node.id).or_default();
                let wish = hop.port.map_or(PortWish::Any, PortWish::Exactly);
                let port = self
                    .ports
                    .pick(node, wish, PortExclusion::None, taken)
                    .await?;
                taken.insert(port);
                Some(port)
            };
            hops.push(NewHop {
                node_id: node.id,
                port,
                protocol: hop.protocol.clone(),
            });
        }

        let (tunnel, _) = self
            .db
            .create_tunnel(
                &NewTunnel {
                    name: &req.name,
                    flow: req.flow,
                    traffic_ratio: req.traffic_ratio,
                    tcp_listen_addr: &req.tcp_listen_addr,
                    udp_listen_addr: &req.udp_listen_addr,
                    interface_name: &req.interface_name,
                },
                &hops,
            )
            .await?;
        drop(lease);

        let steps: Vec<Step> = hops
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .filter_map(|(i, hop)| {
                let port = hop.port?;
                let relay = tunnel_relay_service(
                    tunnel.id,
                    port,
                    &hops[i - 1].protocol,
                    &req.interface_name,
                );
                Some(Step::new(
                    format!("create relay on hop {i}"),
                    hop.node_id,
                    Command::AddService(vec![relay]),
                    Some(remove_tunnel_relay(tunnel.id)),
                ))
            })
            .collect();
        if let Err(e) = run_steps(self.rpc(), &steps).await {
            if let Err(db_err) = self.db.delete_tunnel(tunnel.id).await {
                warn!(tunnel_id = tunnel.id, error = %db_err, "Failed to remove unpushed tunnel");
            }
            return Err(e.into());
        }

        info!(tunnel_id = tunnel.id, hops = hops.len(), "Tunnel created");
        Ok(tunnel)
    }

    /// Delete a tunnel nothing references any more, removing its relays and
    /// limiters from the agents.
    pub async fn delete_tunnel(&self, id: i64) -> Result<(), TunnelError> {
        let route = self
            .load_route(id)
            .await
            .map_err(|e| not_found_as(e, || TunnelError::NotFound(id)))?;
        let (forwards, grants) = self.db.count_tunnel_references(id).await?;
        if forwards > 0 || grants > 0 {
            return Err(TunnelError::InUse {
                tunnel_id: id,
                forwards,
                grants,
            });
        }

        for node in route.downstream() {
            if let Err(e) = remove(self.rpc(), node.id, remove_tunnel_relay(id)).await {
                warn!(tunnel_id = id, node_id = node.id, error = %e, "Failed to remove tunnel relay");
            }
        }
        for limit in self.db.list_speed_limits_by_tunnel(id).await? {
            let command = Command::DeleteLimiters(LimiterRef {
                limiter: limit.id.to_string(),
            });
            if let Err(e) = remove(self.rpc(), route.entry().id, command).await {
                warn!(tunnel_id = id, speed_limit_id = limit.id, error = %e, "Failed to remove limiter");
            }
        }

        self.db.delete_tunnel(id).await?;
        info!(tunnel_id = id, "Tunnel deleted");
        Ok(())
    }

    /// Probe each hop from the one before it, then `target` from the last hop.
    pub async fn diagnose_tunnel(
        &self,
        id: i64,
        target: Option<&str>,
    ) -> Result<Vec<ProbeResult>, TunnelError> {
        let route = self
            .load_route(id)
            .await
            .map_err(|e| not_found_as(e, || TunnelError::NotFound(id)))?;

        let mut results = Vec::new();
        for pair in route.plan_hops().windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let addr = format!("{}:{}", to.host, to.port.unwrap_or_default());
            results.push(self.probe(from.node_id, &addr).await);
        }
        if let Some(target) = target {
            results.push(self.probe(route.last().id, target).await);
        }
        Ok(results)
    }
}
