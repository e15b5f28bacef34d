//! Agent-side artifacts of forwards and tunnels.
//!
//! A [`ForwardPlan`] is the last-known description of where a forward's
//! artifacts live. Every create, update, teardown, pause, and resume command
//! for the forward is derived from it, so an old plan can rebuild exactly
//! what it described.

use fluxgate_proto::naming::{ArtifactKind, tunnel_relay_name};
use fluxgate_proto::service::{
    ChainConfig, ChainRef, ChainUpdate, Connector, Dialer, Forwarder, Handler, Hop, HopNode,
    Listener, Metadata, ServiceConfig, ServiceSelection,
};
use fluxgate_proto::{Command, ServiceName};

use crate::storage::{Node, TunnelNode};

use super::steps::Step;

/// One hop of a tunnel with the address other nodes dial it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanHop {
    pub node_id: i64,
    pub host: String,
    /// Tunnel-level relay port; `None` on the entry.
    pub port: Option<u16>,
    /// Protocol used to dial the next hop.
    pub protocol: String,
}

impl PlanHop {
    pub fn new(hop: &TunnelNode, node: &Node) -> Self {
        Self {
            node_id: node.id,
            host: node.server_ip.clone(),
            port: hop.port.and_then(|p| u16::try_from(p).ok()),
            protocol: hop.protocol.clone(),
        }
    }
}

/// Which part of a forward an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Client-facing tcp/udp listeners on the entry node.
    Entry,
    /// Relay-with-forwarder on the exit node of a multi-hop tunnel.
    Exit,
}

impl Segment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

/// An in-place update and the create it falls back to.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub label: String,
    pub node_id: i64,
    pub update: Command,
    pub create: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPlan {
    pub name: ServiceName,
    pub hops: Vec<PlanHop>,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub tunnel_interface: String,
    pub in_port: u16,
    /// Exit listener port; always set on multi-hop tunnels.
    pub out_port: Option<u16>,
    pub remote_addr: String,
    pub strategy: String,
    pub interface_name: String,
    /// Speed limit id applied to the entry listeners.
    pub limiter: Option<i64>,
}

impl ForwardPlan {
    pub fn entry_node(&self) -> i64 {
        self.hops.first().map_or(0, |h| h.node_id)
    }

    /// Exit hop and its listener port, for multi-hop tunnels.
    fn exit(&self) -> Option<(&PlanHop, u16)> {
        if self.hops.len() < 2 {
            return None;
        }
        let exit = self.hops.last()?;
        Some((exit, self.out_port?))
    }

    pub fn exit_node(&self) -> Option<i64> {
        self.exit().map(|(hop, _)| hop.node_id)
    }

    pub fn is_multi_hop(&self) -> bool {
        self.exit().is_some()
    }

    fn artifact(&self, kind: ArtifactKind) -> String {
        self.name.artifact(kind)
    }

    fn listener_names(&self) -> Vec<String> {
        self.name.listeners().to_vec()
    }

    fn entry_service(&self, proto: &str, listen_addr: &str) -> ServiceConfig {
        let chain = self
            .is_multi_hop()
            .then(|| self.artifact(ArtifactKind::Chains));
        let listener_metadata = (proto == "udp").then(Metadata::keep_alive);
        ServiceConfig {
            name: format!("{}_{proto}", self.name),
            addr: format!("{listen_addr}:{}", self.in_port),
            handler: Handler {
                kind: proto.to_string(),
                chain,
            },
            listener: Listener {
                kind: proto.to_string(),
                metadata: listener_metadata,
            },
            forwarder: Some(Forwarder::fan_out(&self.remote_addr, &self.strategy)),
            limiter: self.limiter.map(|id| id.to_string()),
            metadata: Metadata::interface(&self.interface_name),
        }
    }

    /// The tcp/udp listener pair on the entry node.
    pub fn entry_services(&self) -> Vec<ServiceConfig> {
        vec![
            self.entry_service("tcp", &self.tcp_listen_addr),
            self.entry_service("udp", &self.udp_listen_addr),
        ]
    }

    /// The exit relay that hands traffic to the remote targets.
    pub fn exit_service(&self) -> Option<ServiceConfig> {
        let (_, out_port) = self.exit()?;
        let inbound = &self.hops[self.hops.len() - 2].protocol;
        Some(ServiceConfig {
            name: self.artifact(ArtifactKind::Tls),
            addr: format!(":{out_port}"),
            handler: Handler {
                kind: "relay".to_string(),
                chain: None,
            },
            listener: Listener {
                kind: inbound.clone(),
                metadata: None,
            },
            forwarder: Some(Forwarder::fan_out(&self.remote_addr, &self.strategy)),
            limiter: None,
            metadata: Metadata::interface(&self.interface_name),
        })
    }

    /// The dial path installed on the entry: every downstream hop in order,
    /// interior relays on their tunnel port and the exit on this forward's
    /// port.
    pub fn chain(&self) -> Option<ChainConfig> {
        let (_, out_port) = self.exit()?;
        let last = self.hops.len() - 1;
        let interface = (!self.tunnel_interface.is_empty()).then(|| self.tunnel_interface.clone());
        let hops = self.hops[1..]
            .iter()
            .enumerate()
            .map(|(i, hop)| {
                let position = i + 1;
                let port = if position == last {
                    out_port
                } else {
                    hop.port.unwrap_or_default()
                };
                Hop {
                    name: format!("hop-{position}"),
                    nodes: vec![HopNode {
                        name: format!("node-{position}"),
                        addr: format!("{}:{port}", hop.host),
                        connector: Connector::relay(),
                        dialer: Dialer::for_protocol(&self.hops[i].protocol),
                        interface: interface.clone(),
                    }],
                }
            })
            .collect();
        Some(ChainConfig {
            name: self.artifact(ArtifactKind::Chains),
            hops,
        })
    }

    /// Creation order: exit service, entry chain, entry listeners.
    pub fn create_steps(&self) -> Vec<Step> {
        let entry = self.entry_node();
        let mut steps = Vec::with_capacity(3);
        if let (Some(exit), Some(service), Some(chain)) =
            (self.exit_node(), self.exit_service(), self.chain())
        {
            steps.push(Step::new(
                "create exit service",
                exit,
                Command::AddService(vec![service]),
                Some(self.remove_exit()),
            ));
            steps.push(Step::new(
                "create entry chain",
                entry,
                Command::AddChains(chain),
                Some(self.remove_chain()),
            ));
        }
        steps.push(Step::new(
            "create entry service",
            entry,
            Command::AddService(self.entry_services()),
            Some(self.remove_entry()),
        ));
        steps
    }

    /// In-place updates in creation order.
    pub fn upserts(&self) -> Vec<Upsert> {
        let entry = self.entry_node();
        let mut upserts = Vec::with_capacity(3);
        if let (Some(exit), Some(service), Some(chain)) =
            (self.exit_node(), self.exit_service(), self.chain())
        {
            upserts.push(Upsert {
                label: "update exit service".to_string(),
                node_id: exit,
                update: Command::UpdateService(vec![service.clone()]),
                create: Command::AddService(vec![service]),
            });
            upserts.push(Upsert {
                label: "update entry chain".to_string(),
                node_id: entry,
                update: Command::UpdateChains(ChainUpdate {
                    chain: chain.name.clone(),
                    data: chain.clone(),
                }),
                create: Command::AddChains(chain),
            });
        }
        let services = self.entry_services();
        upserts.push(Upsert {
            label: "update entry service".to_string(),
            node_id: entry,
            update: Command::UpdateService(services.clone()),
            create: Command::AddService(services),
        });
        upserts
    }

    fn remove_entry(&self) -> Command {
        Command::DeleteService(ServiceSelection::new(self.listener_names()))
    }

    fn remove_exit(&self) -> Command {
        Command::DeleteService(ServiceSelection::new([self.artifact(ArtifactKind::Tls)]))
    }

    fn remove_chain(&self) -> Command {
        Command::DeleteChains(ChainRef {
            chain: self.artifact(ArtifactKind::Chains),
        })
    }

    /// Teardown order: entry listeners, exit service, entry chain.
    ///
    /// The first item is the listener removal.
    pub fn teardown(&self) -> Vec<(&'static str, i64, Command)> {
        let entry = self.entry_node();
        let mut steps = vec![("remove entry service", entry, self.remove_entry())];
        if let Some(exit) = self.exit_node() {
            steps.push(("remove exit service", exit, self.remove_exit()));
            steps.push(("remove entry chain", entry, self.remove_chain()));
        }
        steps
    }

    /// Service names of `segment`.
    pub fn segment_services(&self, segment: Segment) -> Vec<String> {
        match segment {
            Segment::Entry => self.listener_names(),
            Segment::Exit if self.is_multi_hop() => vec![self.artifact(ArtifactKind::Tls)],
            Segment::Exit => Vec::new(),
        }
    }

    /// Pausable segments with their node, entry first.
    pub fn segments(&self) -> Vec<(Segment, i64)> {
        let mut segments = vec![(Segment::Entry, self.entry_node())];
        if let Some(exit) = self.exit_node() {
            segments.push((Segment::Exit, exit));
        }
        segments
    }

    pub fn pause_command(&self, segment: Segment) -> Command {
        Command::PauseService(ServiceSelection::new(self.segment_services(segment)))
    }

    pub fn resume_command(&self, segment: Segment) -> Command {
        Command::ResumeService(ServiceSelection::new(self.segment_services(segment)))
    }
}

/// The shared relay listener a tunnel installs on a non-entry hop.
///
/// `inbound` is the protocol the previous hop dials with.
pub fn tunnel_relay_service(
    tunnel_id: i64,
    port: u16,
    inbound: &str,
    interface_name: &str,
) -> ServiceConfig {
    ServiceConfig {
        name: tunnel_relay_name(tunnel_id),
        addr: format!(":{port}"),
        handler: Handler {
            kind: "relay".to_string(),
            chain: None,
        },
        listener: Listener {
            kind: inbound.to_string(),
            metadata: None,
        },
        forwarder: None,
        limiter: None,
        metadata: Metadata::interface(interface_name),
    }
}

pub fn remove_tunnel_relay(tunnel_id: i64) -> Command {
    Command::DeleteService(ServiceSelection::new([tunnel_relay_name(tunnel_id)]))
}
