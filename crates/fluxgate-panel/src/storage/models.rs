//! Data models for Fluxgate panel storage.

use serde::{Deserialize, Serialize};

pub const STATUS_ACTIVE: i64 = 1;
pub const STATUS_PAUSED: i64 = 0;

pub const NODE_ONLINE: i64 = 1;
pub const NODE_OFFLINE: i64 = 0;

/// Tunnel direction mode: only egress counts toward billing.
pub const FLOW_EGRESS_ONLY: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub secret: String,
    pub entry_ips: String,
    pub server_ip: String,
    pub port_ranges: String,
    pub status: i64,
    pub version: Option<String>,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    pub raw_in_flow: i64,
    pub raw_out_flow: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Node {
    /// Entry addresses, falling back to the server address.
    pub fn entry_addresses(&self) -> Vec<String> {
        let ips: Vec<String> = self
            .entry_ips
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(ToString::to_string)
            .collect();
        if ips.is_empty() {
            vec![self.server_ip.clone()]
        } else {
            ips
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub status: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub raw_in_flow: i64,
    pub raw_out_flow: i64,
    pub num: i64,
    pub exp_time: i64,
    pub flow_reset_time: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    pub status: i64,
    pub flow: i64,
    pub traffic_ratio: f64,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopRole {
    Entry,
    Relay,
    Exit,
}

impl HopRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Relay => "relay",
            Self::Exit => "exit",
        }
    }

    /// Role of `position` in a chain of `len` hops.
    pub const fn for_position(position: usize, len: usize) -> Self {
        if position == 0 {
            Self::Entry
        } else if position + 1 == len {
            Self::Exit
        } else {
            Self::Relay
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TunnelNode {
    pub id: i64,
    pub tunnel_id: i64,
    pub node_id: i64,
    pub position: i64,
    pub role: String,
    pub port: Option<i64>,
    pub protocol: String,
}

impl TunnelNode {
    pub fn hop_role(&self) -> HopRole {
        match self.role.as_str() {
            "entry" => HopRole::Entry,
            "exit" => HopRole::Exit,
            _ => HopRole::Relay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub tunnel_id: i64,
    pub in_port: i64,
    pub out_port: Option<i64>,
    pub remote_addr: String,
    pub strategy: String,
    pub interface_name: String,
    pub status: i64,
    pub auto_paused: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub raw_in_flow: i64,
    pub raw_out_flow: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub raw_in_flow: i64,
    pub raw_out_flow: i64,
    pub num: i64,
    pub exp_time: i64,
    pub flow_reset_time: i64,
    pub speed_id: Option<i64>,
    pub status: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpeedLimit {
    pub id: i64,
    pub name: String,
    pub speed: i64,
    pub tunnel_id: i64,
    pub status: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficRecord {
    pub id: i64,
    pub time: String,
    pub node_id: i64,
    pub forward_id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub raw_in: i64,
    pub raw_out: i64,
    pub billing_flow: i64,
    pub created_at: i64,
}
