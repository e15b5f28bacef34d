//! Daily sweep: flow resets on anchor days, full re-check, auto-resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, TimeDelta};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::storage::{DatabaseError, STATUS_ACTIVE, User, UserTunnel};

use super::enforcer::{LimitCheck, LimitEnforcer};
use super::{grant_violation, user_violation};

/// Whether counters anchored on day-of-month `anchor` reset on `today`.
///
/// An anchor past the end of a short month resets on its last day. Anchor 0
/// never resets.
pub fn is_reset_day(anchor: i64, today: NaiveDate) -> bool {
    if anchor <= 0 {
        return false;
    }
    if anchor == i64::from(today.day()) {
        return true;
    }
    let is_last_day = today
        .succ_opt()
        .is_none_or(|next| next.month() != today.month());
    is_last_day && anchor > i64::from(today.day())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub users_reset: usize,
    pub grants_reset: usize,
    pub paused: usize,
    pub resumed: usize,
}

pub struct DailySweep {
    orchestrator: Arc<Orchestrator>,
    enforcer: Arc<LimitEnforcer>,
}

impl DailySweep {
    pub const fn new(orchestrator: Arc<Orchestrator>, enforcer: Arc<LimitEnforcer>) -> Self {
        Self {
            orchestrator,
            enforcer,
        }
    }

    pub async fn run_once(&self, today: NaiveDate, now_ms: i64) -> Result<SweepSummary, DatabaseError> {
        let db = self.orchestrator.db();
        let mut summary = SweepSummary::default();

        for user in db.list_users().await? {
            if is_reset_day(user.flow_reset_time, today) {
                db.reset_user_flow(user.id).await?;
                summary.users_reset += 1;
            }
        }
        for grant in db.list_user_tunnels().await? {
            if is_reset_day(grant.flow_reset_time, today) {
                db.reset_user_tunnel_flow(grant.id).await?;
                summary.grants_reset += 1;
            }
        }

        let users: HashMap<i64, User> = db
            .list_users()
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();
        let grants: HashMap<(i64, i64), UserTunnel> = db
            .list_user_tunnels()
            .await?
            .into_iter()
            .map(|g| ((g.user_id, g.tunnel_id), g))
            .collect();

        for user in users.values() {
            if let Some(violation) = user_violation(user, now_ms) {
                let forwards = db.list_forwards_by_user(user.id).await?;
                summary.paused += self
                    .enforcer
                    .pause_all(&forwards, LimitCheck::User(user.id), violation)
                    .await?;
            }
        }
        for grant in grants.values() {
            if let Some(violation) = grant_violation(grant, now_ms) {
                let forwards = db
                    .list_forwards_by_user_tunnel(grant.user_id, grant.tunnel_id)
                    .await?;
                let scope = LimitCheck::Grant {
                    user_id: grant.user_id,
                    tunnel_id: grant.tunnel_id,
                };
                summary.paused += self.enforcer.pause_all(&forwards, scope, violation).await?;
            }
        }

        for forward in db.list_auto_paused_forwards().await? {
            let user_ok = users
                .get(&forward.user_id)
                .is_some_and(|u| user_violation(u, now_ms).is_none());
            let grant_ok = grants
                .get(&(forward.user_id, forward.tunnel_id))
                .is_some_and(|g| grant_violation(g, now_ms).is_none());
            if !user_ok || !grant_ok {
                continue;
            }
            let tunnel = db.get_tunnel(forward.tunnel_id).await?;
            if tunnel.status != STATUS_ACTIVE {
                continue;
            }
            match self.orchestrator.plan_for(&forward).await {
                Ok(plan) => {
                    self.orchestrator.sync_state(&plan, false, None).await;
                }
                Err(e) => {
                    warn!(forward_id = forward.id, error = %e, "No plan for forward; resuming in storage only");
                }
            }
            db.set_forward_status(forward.id, STATUS_ACTIVE, false).await?;
            summary.resumed += 1;
        }

        Ok(summary)
    }

    /// Run once a day at `hour` local time until shutdown.
    pub async fn run(&self, hour: u32, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = until_next(hour);
            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    let now = Local::now();
                    match self.run_once(now.date_naive(), now.timestamp_millis()).await {
                        Ok(summary) => info!(?summary, "Daily sweep completed"),
                        Err(e) => warn!(error = %e, "Daily sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Daily sweep stopped");
    }
}

/// Time from now until the next `hour:00` local time.
fn until_next(hour: u32) -> Duration {
    let now = Local::now();
    let today = now.date_naive();
    let next = [today, today + TimeDelta::days(1)]
        .into_iter()
        .filter_map(|day| day.and_hms_opt(hour.min(23), 0, 0))
        .filter_map(|at| at.and_local_timezone(Local).earliest())
        .find(|at| *at > now);
    next.and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 3600))
}
