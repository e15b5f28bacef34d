//! Forward lifecycle: create, update, delete, pause, resume, diagnose.

use std::collections::BTreeSet;

use fluxgate_core::db::unix_millis;
use fluxgate_proto::ServiceName;
use fluxgate_proto::naming::NO_USER_TUNNEL;
use tracing::{info, warn};

use crate::alloc::{PortError, PortWish, check_self_loop};
use crate::limits::{grant_violation, user_violation};
use crate::router::RpcError;
use crate::storage::{
    Forward, ForwardParams, PortExclusion, STATUS_ACTIVE, STATUS_PAUSED, Tunnel, UserTunnel,
};

use super::descriptors::{ForwardPlan, Segment};
use super::error::{ForwardError, OrchestrationError, not_found_as};
use super::steps::{remove, run_steps, update_or_create};
use super::{Orchestrator, ProbeResult, Route, tunnel_missing};

/// Administrative input for creating or rewriting a forward.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub user_id: i64,
    pub name: String,
    pub tunnel_id: i64,
    /// Entry port; the lowest free port when unset.
    pub in_port: Option<u16>,
    /// Comma-separated `host:port` targets.
    pub remote_addr: String,
    pub strategy: String,
    pub interface_name: String,
}

/// Which forward-count caps an admission re-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caps {
    /// A new forward: both the user's and the grant's caps.
    New,
    /// An existing forward moving to another tunnel: the grant's cap.
    Moved,
    Unchanged,
}

/// How an update reaches the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdatePath {
    InPlace,
    DeleteThenCreate,
    CreateThenDelete,
}

fn port_u16(port: i64) -> Result<u16, ForwardError> {
    u16::try_from(port)
        .map_err(|_| ForwardError::Port(PortError::InvalidRange(format!("stored port {port}"))))
}

/// Describe where `forward`'s artifacts live on `route`.
fn build_plan(
    route: &Route,
    forward: &Forward,
    grant: Option<&UserTunnel>,
) -> Result<ForwardPlan, ForwardError> {
    let out_port = forward.out_port.map(port_u16).transpose()?;
    if route.exit().is_some() && out_port.is_none() {
        return Err(ForwardError::MissingExitPort(forward.id));
    }
    Ok(ForwardPlan {
        name: ServiceName::new(
            forward.id,
            forward.user_id,
            grant.map_or(NO_USER_TUNNEL, |g| g.id),
        ),
        hops: route.plan_hops(),
        tcp_listen_addr: route.tunnel.tcp_listen_addr.clone(),
        udp_listen_addr: route.tunnel.udp_listen_addr.clone(),
        tunnel_interface: route.tunnel.interface_name.clone(),
        in_port: port_u16(forward.in_port)?,
        out_port,
        remote_addr: forward.remote_addr.clone(),
        strategy: forward.strategy.clone(),
        interface_name: forward.interface_name.clone(),
        limiter: grant.and_then(|g| g.speed_id),
    })
}

impl Orchestrator {
    // =========================================================================
    // Planning
    // =========================================================================

    async fn get_forward(&self, id: i64) -> Result<Forward, ForwardError> {
        self.db
            .get_forward(id)
            .await
            .map_err(|e| not_found_as(e, || ForwardError::NotFound(id)))
    }

    /// The current plan of a stored forward.
    pub async fn plan_for(&self, forward: &Forward) -> Result<ForwardPlan, ForwardError> {
        let route = self
            .load_route(forward.tunnel_id)
            .await
            .map_err(tunnel_missing(forward.tunnel_id))?;
        let grant = self
            .db
            .find_user_tunnel(forward.user_id, forward.tunnel_id)
            .await?;
        build_plan(&route, forward, grant.as_ref())
    }

    /// Check that `user_id` may run a forward on `tunnel` and return the grant.
    async fn admit(
        &self,
        user_id: i64,
        tunnel: &Tunnel,
        caps: Caps,
    ) -> Result<UserTunnel, ForwardError> {
        if tunnel.status != STATUS_ACTIVE {
            return Err(ForwardError::TunnelDisabled(tunnel.id));
        }
        let now_ms = unix_millis();

        let user = self.db.get_user(user_id).await?;
        if let Some(violation) = user_violation(&user, now_ms) {
            return Err(ForwardError::UserDenied { user_id, violation });
        }
        if caps == Caps::New && user.num > 0 {
            let count = self.db.count_forwards_by_user(user_id).await?;
            if count >= user.num {
                return Err(ForwardError::ForwardLimit { limit: user.num });
            }
        }

        let grant = self
            .db
            .find_user_tunnel(user_id, tunnel.id)
            .await?
            .ok_or(ForwardError::NoGrant {
                user_id,
                tunnel_id: tunnel.id,
            })?;
        if let Some(violation) = grant_violation(&grant, now_ms) {
            return Err(ForwardError::GrantDenied {
                user_id,
                tunnel_id: tunnel.id,
                violation,
            });
        }
        if caps != Caps::Unchanged && grant.num > 0 {
            let count = self
                .db
                .count_forwards_by_user_tunnel(user_id, tunnel.id)
                .await?;
            if count >= grant.num {
                return Err(ForwardError::ForwardLimit { limit: grant.num });
            }
        }
        Ok(grant)
    }

    /// Pick the entry port and, for multi-hop routes, the exit port.
    ///
    /// The caller must hold a lease on `route.port_nodes()`.
    async fn allocate(
        &self,
        route: &Route,
        in_wish: PortWish,
        out_wish: PortWish,
        exclude: PortExclusion,
    ) -> Result<(u16, Option<u16>), ForwardError> {
        let entry = route.entry();
        let in_port = self
            .ports
            .pick(entry, in_wish, exclude, &BTreeSet::new())
            .await?;
        let out_port = match route.exit() {
            Some(exit) => {
                let reserved = if exit.id == entry.id {
                    BTreeSet::from([in_port])
                } else {
                    BTreeSet::new()
                };
                Some(self.ports.pick(exit, out_wish, exclude, &reserved).await?)
            }
            None => None,
        };
        Ok((in_port, out_port))
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create_forward(&self, req: &ForwardRequest) -> Result<Forward, ForwardError> {
        let route = self
            .load_route(req.tunnel_id)
            .await
            .map_err(tunnel_missing(req.tunnel_id))?;
        let grant = self.admit(req.user_id, &route.tunnel, Caps::New).await?;

        let lease = self.ports.lease(&route.port_nodes()).await;
        let in_wish = req.in_port.map_or(PortWish::Any, PortWish::Exactly);
        let (in_port, out_port) = self
            .allocate(&route, in_wish, PortWish::Any, PortExclusion::None)
            .await?;
        check_self_loop(route.entry(), in_port, &req.remote_addr).await?;

        let forward = self
            .db
            .create_forward(&ForwardParams {
                user_id: req.user_id,
                name: &req.name,
                tunnel_id: req.tunnel_id,
                in_port,
                out_port,
                remote_addr: &req.remote_addr,
                strategy: &req.strategy,
                interface_name: &req.interface_name,
            })
            .await?;
        drop(lease);

        let pushed = match build_plan(&route, &forward, Some(&grant)) {
            Ok(plan) => run_steps(self.rpc(), &plan.create_steps())
                .await
                .map_err(ForwardError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            if let Err(db_err) = self.db.delete_forward(forward.id).await {
                warn!(forward_id = forward.id, error = %db_err, "Failed to remove unpushed forward");
            }
            return Err(e);
        }

        info!(
            forward_id = forward.id,
            user_id = forward.user_id,
            tunnel_id = forward.tunnel_id,
            in_port,
            "Forward created"
        );
        Ok(forward)
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Rewrite a forward's route, ports, or targets.
    ///
    /// `req.user_id` is ignored; a forward never changes owner.
    pub async fn update_forward(&self, id: i64, req: &ForwardRequest) -> Result<Forward, ForwardError> {
        let old = self.get_forward(id).await?;
        let old_plan = self.plan_for(&old).await?;

        let route = self
            .load_route(req.tunnel_id)
            .await
            .map_err(tunnel_missing(req.tunnel_id))?;
        let tunnel_changed = req.tunnel_id != old.tunnel_id;
        let caps = if tunnel_changed {
            Caps::Moved
        } else {
            Caps::Unchanged
        };
        let grant = self.admit(old.user_id, &route.tunnel, caps).await?;

        let lease = self.ports.lease(&route.port_nodes()).await;
        let same_entry = route.entry().id == old_plan.entry_node();
        let in_wish = match req.in_port {
            Some(port) => PortWish::Exactly(port),
            None if same_entry => PortWish::Prefer(old_plan.in_port),
            None => PortWish::Any,
        };
        let out_wish = match (route.exit(), old_plan.exit_node(), old_plan.out_port) {
            (Some(exit), Some(old_exit), Some(port)) if exit.id == old_exit => PortWish::Prefer(port),
            _ => PortWish::Any,
        };
        let (in_port, out_port) = self
            .allocate(&route, in_wish, out_wish, PortExclusion::Forward(id))
            .await?;
        check_self_loop(route.entry(), in_port, &req.remote_addr).await?;

        let next = Forward {
            name: req.name.clone(),
            tunnel_id: req.tunnel_id,
            in_port: i64::from(in_port),
            out_port: out_port.map(i64::from),
            remote_addr: req.remote_addr.clone(),
            strategy: req.strategy.clone(),
            interface_name: req.interface_name.clone(),
            ..old.clone()
        };
        let new_plan = build_plan(&route, &next, Some(&grant))?;

        let path = if !tunnel_changed {
            UpdatePath::InPlace
        } else if same_entry {
            UpdatePath::DeleteThenCreate
        } else {
            UpdatePath::CreateThenDelete
        };
        let leftover = match path {
            UpdatePath::InPlace => {
                self.apply_in_place(&old_plan, &new_plan).await?;
                None
            }
            UpdatePath::DeleteThenCreate => {
                self.replace_on_same_entry(&old_plan, &new_plan).await?;
                None
            }
            UpdatePath::CreateThenDelete => {
                run_steps(self.rpc(), &new_plan.create_steps()).await?;
                self.teardown(&old_plan).await.err()
            }
        };

        let forward = self
            .db
            .update_forward(
                id,
                &ForwardParams {
                    user_id: old.user_id,
                    name: &req.name,
                    tunnel_id: req.tunnel_id,
                    in_port,
                    out_port,
                    remote_addr: &req.remote_addr,
                    strategy: &req.strategy,
                    interface_name: &req.interface_name,
                },
            )
            .await?;
        drop(lease);
        // Pushed artifacts start running; a paused forward stays paused,
        // keeping its stored status and whether enforcement paused it.
        if old.status != STATUS_ACTIVE {
            let failed = self.sync_state(&new_plan, true, None).await;
            if failed > 0 {
                warn!(forward_id = id, failed, "Updated forward not re-paused on every segment");
            }
        }

        info!(forward_id = id, ?path, in_port, "Forward updated");
        if let Some(e) = leftover {
            return Err(OrchestrationError::Recovery(format!(
                "new service created but could not remove old service: {e}"
            ))
            .into());
        }
        Ok(forward)
    }

    /// Update each segment in place, creating any the agent lacks. On failure,
    /// put the old descriptors back.
    async fn apply_in_place(
        &self,
        old: &ForwardPlan,
        new: &ForwardPlan,
    ) -> Result<(), OrchestrationError> {
        for upsert in new.upserts() {
            let result = update_or_create(
                self.rpc(),
                &upsert.label,
                upsert.node_id,
                upsert.update,
                upsert.create,
            )
            .await;
            if let Err(e) = result {
                for restore in old.upserts() {
                    if let Err(re) = update_or_create(
                        self.rpc(),
                        &restore.label,
                        restore.node_id,
                        restore.update,
                        restore.create,
                    )
                    .await
                    {
                        warn!(node_id = restore.node_id, error = %re, "Failed to restore previous descriptor");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// The entry listener port cannot be bound twice on one node, so the old
    /// artifacts go first. If the new ones fail, rebuild the old.
    async fn replace_on_same_entry(
        &self,
        old: &ForwardPlan,
        new: &ForwardPlan,
    ) -> Result<(), OrchestrationError> {
        if let Err(e) = self.teardown(old).await {
            warn!(forward_id = old.name.forward_id, error = %e, "Old listeners may remain");
        }
        let Err(e) = run_steps(self.rpc(), &new.create_steps()).await else {
            return Ok(());
        };
        match run_steps(self.rpc(), &old.create_steps()).await {
            Ok(()) => Err(e),
            Err(restore) => Err(OrchestrationError::Recovery(format!(
                "new service creation failed and old could not be restored: {e}; restore error: {restore}"
            ))),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove every artifact of `plan`, entry listeners first. Only a failure
    /// to remove the listeners is returned; the rest are logged.
    async fn teardown(&self, plan: &ForwardPlan) -> Result<(), OrchestrationError> {
        let mut listeners = Ok(());
        for (index, (label, node_id, command)) in plan.teardown().into_iter().enumerate() {
            if let Err(e) = remove(self.rpc(), node_id, command).await {
                warn!(forward_id = plan.name.forward_id, node_id, step = label, error = %e, "Teardown step failed");
                if index == 0 {
                    listeners = Err(OrchestrationError::Step {
                        step: label.to_string(),
                        source: e,
                    });
                }
            }
        }
        listeners
    }

    pub async fn delete_forward(&self, id: i64) -> Result<(), ForwardError> {
        let forward = self.get_forward(id).await?;
        match self.plan_for(&forward).await {
            Ok(plan) => self.teardown(&plan).await?,
            Err(ForwardError::TunnelNotFound(tunnel_id)) => {
                warn!(forward_id = id, tunnel_id, "Tunnel gone; removing forward record only");
            }
            Err(e) => return Err(e),
        }
        self.db.delete_forward(id).await?;
        info!(forward_id = id, "Forward deleted");
        Ok(())
    }

    /// Drop the record without touching any agent.
    pub async fn force_delete_forward(&self, id: i64) -> Result<(), ForwardError> {
        if !self.db.delete_forward(id).await? {
            return Err(ForwardError::NotFound(id));
        }
        warn!(forward_id = id, "Forward force-deleted; agent artifacts were left in place");
        Ok(())
    }

    // =========================================================================
    // Pause / resume
    // =========================================================================

    /// Pause or resume every segment, entry first. If a later segment fails,
    /// the entry is switched back.
    async fn switch_segments(&self, plan: &ForwardPlan, paused: bool) -> Result<(), OrchestrationError> {
        let command = |segment| {
            if paused {
                plan.pause_command(segment)
            } else {
                plan.resume_command(segment)
            }
        };
        let revert = |segment| {
            if paused {
                plan.resume_command(segment)
            } else {
                plan.pause_command(segment)
            }
        };

        let mut done: Vec<(Segment, i64)> = Vec::new();
        for (segment, node_id) in plan.segments() {
            if let Err(source) = self.rpc().execute(node_id, command(segment)).await {
                for (seg, node) in done.iter().rev() {
                    if let Err(e) = self.rpc().execute(*node, revert(*seg)).await {
                        warn!(node_id = node, segment = seg.as_str(), error = %e, "Failed to revert segment");
                    }
                }
                let verb = if paused { "pause" } else { "resume" };
                return Err(OrchestrationError::Step {
                    step: format!("{verb} {} service", segment.as_str()),
                    source,
                });
            }
            done.push((segment, node_id));
        }
        Ok(())
    }

    pub async fn pause_forward(&self, id: i64) -> Result<(), ForwardError> {
        let forward = self.get_forward(id).await?;
        let plan = self.plan_for(&forward).await?;
        self.switch_segments(&plan, true).await?;
        self.db.set_forward_status(id, STATUS_PAUSED, false).await?;
        info!(forward_id = id, "Forward paused");
        Ok(())
    }

    /// Resume a paused forward after re-checking tunnel, user, and grant.
    pub async fn resume_forward(&self, id: i64) -> Result<(), ForwardError> {
        let forward = self.get_forward(id).await?;
        let route = self
            .load_route(forward.tunnel_id)
            .await
            .map_err(tunnel_missing(forward.tunnel_id))?;
        let grant = self
            .admit(forward.user_id, &route.tunnel, Caps::Unchanged)
            .await?;
        let plan = build_plan(&route, &forward, Some(&grant))?;
        self.switch_segments(&plan, false).await?;
        self.db.set_forward_status(id, STATUS_ACTIVE, false).await?;
        info!(forward_id = id, "Forward resumed");
        Ok(())
    }

    /// Push a pause or resume to each segment without rollback, optionally
    /// only those hosted on `only_node`. Failures are logged; returns how many
    /// commands failed.
    pub async fn sync_state(&self, plan: &ForwardPlan, paused: bool, only_node: Option<i64>) -> usize {
        let mut failures = 0;
        for (segment, node_id) in plan.segments() {
            if only_node.is_some_and(|n| n != node_id) {
                continue;
            }
            let command = if paused {
                plan.pause_command(segment)
            } else {
                plan.resume_command(segment)
            };
            if let Err(e) = self.rpc().execute(node_id, command).await {
                failures += 1;
                log_sync_failure(plan, segment, node_id, paused, &e);
            }
        }
        failures
    }

    // =========================================================================
    // Diagnose
    // =========================================================================

    /// Probe the forward's path: entry to each target, or entry to exit and
    /// exit to each target on multi-hop tunnels.
    pub async fn diagnose_forward(&self, id: i64) -> Result<Vec<ProbeResult>, ForwardError> {
        let forward = self.get_forward(id).await?;
        let plan = self.plan_for(&forward).await?;
        let targets: Vec<&str> = plan
            .remote_addr
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        let mut results = Vec::new();
        let last_hop = match (plan.exit_node(), plan.out_port, plan.hops.last()) {
            (Some(exit), Some(out_port), Some(hop)) => {
                let exit_addr = format!("{}:{out_port}", hop.host);
                results.push(self.probe(plan.entry_node(), &exit_addr).await);
                exit
            }
            _ => plan.entry_node(),
        };
        for target in targets {
            results.push(self.probe(last_hop, target).await);
        }
        Ok(results)
    }
}

fn log_sync_failure(plan: &ForwardPlan, segment: Segment, node_id: i64, paused: bool, e: &RpcError) {
    warn!(
        forward_id = plan.name.forward_id,
        node_id,
        segment = segment.as_str(),
        paused,
        error = %e,
        "Failed to push forward state; will converge on reconnect"
    );
}
