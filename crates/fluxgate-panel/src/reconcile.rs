//! Converges agents toward the state storage says they should run.
//!
//! Pause and resume are recorded in storage even when the agent missed the
//! command, so a node that reconnects gets its stored protocols and every
//! segment it hosts re-pushed, and a config report listing a service that should be paused gets the
//! pause pushed again.

use std::collections::HashSet;
use std::sync::Arc;

use fluxgate_proto::naming::tunnel_relay_name;
use fluxgate_proto::report::MANAGEMENT_SERVICE;
use fluxgate_proto::ConfigReport;
use tracing::{debug, info, warn};

use crate::orchestrator::{ForwardPlan, Orchestrator};
use crate::storage::{DatabaseError, HopRole, STATUS_ACTIVE};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub pushed: usize,
    pub failed: usize,
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
}

impl Reconciler {
    pub const fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Plans of every forward with a segment on `node_id`, with whether the
    /// forward should be paused.
    async fn plans_on(&self, node_id: i64) -> Result<Vec<(ForwardPlan, bool)>, DatabaseError> {
        let forwards = self.orchestrator.db().list_forwards_on_node(node_id).await?;
        let mut plans = Vec::with_capacity(forwards.len());
        for forward in forwards {
            match self.orchestrator.plan_for(&forward).await {
                Ok(plan) => plans.push((plan, forward.status != STATUS_ACTIVE)),
                Err(e) => warn!(forward_id = forward.id, error = %e, "Cannot plan forward for reconciliation"),
            }
        }
        Ok(plans)
    }

    /// Re-push the stored protocols, then pause or resume for every forward
    /// segment hosted on a node that just connected.
    ///
    /// The summary counts segments only.
    pub async fn on_node_connected(&self, node_id: i64) -> ReconcileSummary {
        if let Err(e) = self.orchestrator.restore_node_protocol(node_id).await {
            warn!(node_id, error = %e, "Stored protocols not pushed to node");
        }
        let plans = match self.plans_on(node_id).await {
            Ok(plans) => plans,
            Err(e) => {
                warn!(node_id, error = %e, "Reconciliation skipped");
                return ReconcileSummary::default();
            }
        };
        let mut summary = ReconcileSummary::default();
        for (plan, paused) in &plans {
            let hosted = plan.segments().iter().filter(|(_, n)| *n == node_id).count();
            let failed = self.orchestrator.sync_state(plan, *paused, Some(node_id)).await;
            summary.pushed += hosted - failed;
            summary.failed += failed;
        }
        info!(node_id, pushed = summary.pushed, failed = summary.failed, "Node reconciled");
        summary
    }

    /// Compare the services an agent runs with what storage expects.
    ///
    /// Unexpected services are logged. Paused forwards whose services are
    /// still running get their pause pushed again.
    pub async fn on_config_report(&self, node_id: i64, report: &ConfigReport) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let plans = match self.plans_on(node_id).await {
            Ok(plans) => plans,
            Err(e) => {
                warn!(node_id, error = %e, "Config report not reconciled");
                return summary;
            }
        };

        let mut expected: HashSet<String> = HashSet::new();
        match self.orchestrator.db().list_hops_on_node(node_id).await {
            Ok(hops) => expected.extend(
                hops.iter()
                    .filter(|h| h.hop_role() != HopRole::Entry)
                    .map(|h| tunnel_relay_name(h.tunnel_id)),
            ),
            Err(e) => warn!(node_id, error = %e, "Failed to list tunnel hops on node"),
        }
        for (plan, _) in &plans {
            for (segment, host) in plan.segments() {
                if host == node_id {
                    expected.extend(plan.segment_services(segment));
                }
            }
        }

        let running: HashSet<&str> = report.services.iter().map(|s| s.name.as_str()).collect();
        for name in &running {
            if !name.starts_with(MANAGEMENT_SERVICE) && !expected.contains(*name) {
                warn!(node_id, service = %name, "Agent runs a service the panel does not know");
            }
        }

        for (plan, paused) in &plans {
            if !*paused {
                continue;
            }
            let still_running = plan.segments().into_iter().any(|(segment, host)| {
                host == node_id
                    && plan
                        .segment_services(segment)
                        .iter()
                        .any(|s| running.contains(s.as_str()))
            });
            if still_running {
                debug!(node_id, forward_id = plan.name.forward_id, "Re-pushing pause");
                let failed = self.orchestrator.sync_state(plan, true, Some(node_id)).await;
                summary.pushed += usize::from(failed == 0);
                summary.failed += failed;
            }
        }
        summary
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use fluxgate_proto::report::ReportedService;
    use fluxgate_proto::{Command, ProtocolFlags};

    use super::*;
    use crate::orchestrator::ForwardRequest;
    use crate::orchestrator::test_helpers::Fixture;
    use crate::router::RpcError;
    use crate::storage::Forward;

    async fn forward_on(fx: &Fixture, tunnel_id: i64) -> Forward {
        fx.orch
            .create_forward(&ForwardRequest {
                user_id: fx.user.id,
                name: "svc".into(),
                tunnel_id,
                in_port: None,
                remote_addr: "192.0.2.10:443".into(),
                strategy: String::new(),
                interface_name: String::new(),
            })
            .await
            .unwrap()
    }

    fn report(names: &[&str]) -> ConfigReport {
        ConfigReport {
            services: names
                .iter()
                .map(|n| ReportedService {
                    name: (*n).to_string(),
                    addr: String::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn reconnect_pushes_state_of_hosted_segments() {
        let fx = Fixture::new().await;
        let a = fx.node("a", "10.0.0.1", "10000-10010").await;
        let b = fx.node("b", "10.0.0.2", "20000-20010").await;
        let tunnel = fx.tunnel(&[(a, None), (b, Some(20000))]).await;
        fx.grant(tunnel.id).await;
        forward_on(&fx, tunnel.id).await;
        let paused = forward_on(&fx, tunnel.id).await;
        fx.orch.pause_forward(paused.id).await.unwrap();
        fx.rpc.clear();
        fx.rpc.fail("ResumeService", None, RpcError::Offline(b));

        let reconciler = Reconciler::new(Arc::clone(&fx.orch));
        let summary = reconciler.on_node_connected(b).await;
        assert_eq!(summary, ReconcileSummary { pushed: 1, failed: 1 });
        assert_eq!(
            fx.rpc.trace(),
            vec![("SetProtocol", b), ("ResumeService", b), ("PauseService", b)]
        );
    }

    #[tokio::test]
    async fn reconnect_restores_stored_protocols() {
        let fx = Fixture::new().await;
        let a = fx.node("a", "10.0.0.1", "10000-10010").await;
        let flags = ProtocolFlags {
            http: 1,
            tls: 0,
            socks: 1,
        };
        fx.orch.set_node_protocol(a, flags).await.unwrap();
        fx.rpc.fail_once("SetProtocol", Some(a), RpcError::Offline(a));

        let reconciler = Reconciler::new(Arc::clone(&fx.orch));
        assert_eq!(reconciler.on_node_connected(a).await, ReconcileSummary::default());
        reconciler.on_node_connected(a).await;
        assert_eq!(
            fx.rpc.calls(),
            vec![(a, Command::SetProtocol(flags)), (a, Command::SetProtocol(flags))]
        );
    }

    #[tokio::test]
    async fn config_report_re_pauses_running_paused_services() {
        let fx = Fixture::new().await;
        let a = fx.node("a", "10.0.0.1", "10000-10010").await;
        let tunnel = fx.tunnel(&[(a, None)]).await;
        let grant = fx.grant(tunnel.id).await;
        let forward = forward_on(&fx, tunnel.id).await;
        fx.orch.pause_forward(forward.id).await.unwrap();
        fx.rpc.clear();

        let name = format!("{}_{}_{}", forward.id, fx.user.id, grant.id);
        let reconciler = Reconciler::new(Arc::clone(&fx.orch));
        let summary = reconciler
            .on_config_report(
                a,
                &report(&[&format!("{name}_tcp"), "web_api_8080", "stray_1_1_tcp"]),
            )
            .await;
        assert_eq!(summary.pushed, 1);
        assert_eq!(fx.rpc.trace(), vec![("PauseService", a)]);

        // Nothing of the paused forward runs any more.
        fx.rpc.clear();
        reconciler.on_config_report(a, &report(&["web_api"])).await;
        assert!(fx.rpc.calls().is_empty());
    }
}
