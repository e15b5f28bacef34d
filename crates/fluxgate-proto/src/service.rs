//! Descriptors pushed to agents inside command frames.
//!
//! Field names follow the agent's configuration schema (camelCase where the
//! agent expects it); optional fields are omitted rather than sent as null.

use serde::{Deserialize, Serialize};

/// Load-balancing strategy used when a forward has none configured.
pub const DEFAULT_STRATEGY: &str = "fifo";

/// Free-form metadata block shared by services, listeners and dialers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl Metadata {
    pub fn interface(name: &str) -> Option<Self> {
        (!name.is_empty()).then(|| Self {
            interface: Some(name.to_string()),
            ..Self::default()
        })
    }

    pub fn keep_alive() -> Self {
        Self {
            keep_alive: Some(true),
            ..Self::default()
        }
    }
}

/// One listener + handler (+ optional forwarder) on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub handler: Handler,
    pub listener: Listener,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<Forwarder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwarder {
    pub nodes: Vec<ForwardTarget>,
    pub selector: Selector,
}

impl Forwarder {
    /// Build a forwarder fanning out over a comma-separated target list.
    pub fn fan_out(remote_addr: &str, strategy: &str) -> Self {
        let nodes = remote_addr
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .enumerate()
            .map(|(i, addr)| ForwardTarget {
                name: format!("node_{}", i + 1),
                addr: addr.to_string(),
            })
            .collect();
        Self {
            nodes,
            selector: Selector::with_strategy(strategy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    pub strategy: String,
    pub max_fails: u32,
    pub fail_timeout: String,
}

impl Selector {
    pub fn with_strategy(strategy: &str) -> Self {
        let strategy = if strategy.is_empty() {
            DEFAULT_STRATEGY
        } else {
            strategy
        };
        Self {
            strategy: strategy.to_string(),
            max_fails: 1,
            fail_timeout: "20s".to_string(),
        }
    }
}

/// Ordered dial path installed on an entry node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<Hop>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub name: String,
    pub nodes: Vec<HopNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopNode {
    pub name: String,
    pub addr: String,
    pub connector: Connector,
    pub dialer: Dialer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Connector {
    pub fn relay() -> Self {
        Self {
            kind: "relay".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialer {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Dialer {
    /// QUIC dialers need keep-alive or idle paths get reaped by middleboxes.
    pub fn for_protocol(protocol: &str) -> Self {
        let metadata = (protocol == "quic").then(|| Metadata {
            keep_alive: Some(true),
            ttl: Some("10s".to_string()),
            ..Metadata::default()
        });
        Self {
            kind: protocol.to_string(),
            metadata,
        }
    }
}

/// Replacement payload for an existing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUpdate {
    pub chain: String,
    pub data: ChainConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRef {
    pub chain: String,
}

/// Bandwidth limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    pub limits: Vec<String>,
}

impl LimiterConfig {
    /// Build a limiter from a speed in megabits per second.
    ///
    /// The agent expects megabytes per second for both directions.
    pub fn from_mbps(name: &str, mbps: u32) -> Self {
        let megabytes = f64::from(mbps) / 8.0;
        Self {
            name: name.to_string(),
            limits: vec![format!("$ {megabytes:.1}MB {megabytes:.1}MB")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterUpdate {
    pub limiter: String,
    pub data: LimiterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterRef {
    pub limiter: String,
}

/// Selection of services by name for delete/pause/resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelection {
    pub services: Vec<String>,
}

impl ServiceSelection {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ask an agent to probe reachability of another address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPingRequest {
    pub ip: String,
    pub port: u16,
    pub count: u32,
    /// Milliseconds.
    pub timeout: u32,
}

impl TcpPingRequest {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            count: 4,
            timeout: 5000,
        }
    }
}
