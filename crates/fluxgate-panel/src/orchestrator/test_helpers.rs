//! Scripted agent RPC and storage fixtures for orchestration tests.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use fluxgate_proto::{AgentReply, Command};

use crate::router::{AgentRpc, RpcError};
use crate::storage::{
    NewHop, NewNode, NewTunnel, NewUser, NewUserTunnel, PanelDatabase, Tunnel, User, UserTunnel,
};

use super::Orchestrator;

struct Rule {
    kind: &'static str,
    node_id: Option<i64>,
    error: RpcError,
    remaining: Option<usize>,
}

/// Records every call and answers OK unless a rule matches.
#[derive(Default)]
pub struct MockRpc {
    calls: Mutex<Vec<(i64, Command)>>,
    rules: Mutex<Vec<Rule>>,
}

impl MockRpc {
    /// Fail every `kind` command (on `node_id`, if given) with `error`.
    pub fn fail(&self, kind: &'static str, node_id: Option<i64>, error: RpcError) {
        self.push_rule(kind, node_id, error, None);
    }

    /// Fail the next matching command only.
    pub fn fail_once(&self, kind: &'static str, node_id: Option<i64>, error: RpcError) {
        self.push_rule(kind, node_id, error, Some(1));
    }

    fn push_rule(&self, kind: &'static str, node_id: Option<i64>, error: RpcError, remaining: Option<usize>) {
        self.rules.lock().unwrap().push(Rule {
            kind,
            node_id,
            error,
            remaining,
        });
    }

    pub fn calls(&self) -> Vec<(i64, Command)> {
        self.calls.lock().unwrap().clone()
    }

    /// `(kind, node)` of every call, in order.
    pub fn trace(&self) -> Vec<(&'static str, i64)> {
        self.calls().iter().map(|(node, cmd)| (cmd.kind(), *node)).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl AgentRpc for MockRpc {
    async fn call(&self, node_id: i64, command: Command) -> Result<AgentReply, RpcError> {
        let kind = command.kind();
        self.calls.lock().unwrap().push((node_id, command));

        let mut rules = self.rules.lock().unwrap();
        let hit = rules.iter_mut().position(|rule| {
            rule.kind == kind
                && rule.node_id.is_none_or(|n| n == node_id)
                && rule.remaining != Some(0)
        });
        if let Some(index) = hit {
            let rule = &mut rules[index];
            if let Some(left) = rule.remaining.as_mut() {
                *left -= 1;
            }
            return match &rule.error {
                RpcError::Rejected(message) => Ok(AgentReply {
                    message: message.clone(),
                    data: Value::Null,
                    request_id: None,
                }),
                other => Err(other.clone()),
            };
        }
        Ok(AgentReply {
            message: "OK".to_string(),
            data: serde_json::json!({"reachable": true}),
            request_id: None,
        })
    }
}

pub struct Fixture {
    pub db: PanelDatabase,
    pub rpc: Arc<MockRpc>,
    pub orch: Arc<Orchestrator>,
    pub user: User,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_user(NewUser {
            username: "alice",
            ..NewUser::default()
        })
        .await
    }

    pub async fn with_user(params: NewUser<'_>) -> Self {
        let db = PanelDatabase::open_in_memory().await.unwrap();
        let rpc = Arc::new(MockRpc::default());
        let orch = Arc::new(Orchestrator::new(
            db.clone(),
            Arc::clone(&rpc) as Arc<dyn AgentRpc>,
        ));
        let user = db.create_user(&params).await.unwrap();
        Self { db, rpc, orch, user }
    }

    pub async fn node(&self, name: &str, server_ip: &str, port_ranges: &str) -> i64 {
        self.db
            .create_node(&NewNode {
                name,
                secret: &format!("secret-{name}"),
                entry_ips: server_ip,
                server_ip,
                port_ranges,
            })
            .await
            .unwrap()
            .id
    }

    /// A tunnel stored directly, without pushing relays.
    pub async fn tunnel(&self, hops: &[(i64, Option<u16>)]) -> Tunnel {
        let hops: Vec<NewHop> = hops
            .iter()
            .map(|&(node_id, port)| NewHop {
                node_id,
                port,
                protocol: "tls".into(),
            })
            .collect();
        self.db
            .create_tunnel(
                &NewTunnel {
                    name: "t",
                    flow: 2,
                    traffic_ratio: 1.0,
                    tcp_listen_addr: "[::]",
                    udp_listen_addr: "[::]",
                    interface_name: "",
                },
                &hops,
            )
            .await
            .unwrap()
            .0
    }

    pub async fn grant(&self, tunnel_id: i64) -> UserTunnel {
        self.db
            .create_user_tunnel(&NewUserTunnel {
                user_id: self.user.id,
                tunnel_id,
                ..NewUserTunnel::default()
            })
            .await
            .unwrap()
    }
}
