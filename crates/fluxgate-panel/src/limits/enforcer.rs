//! Inline enforcement fed by traffic reports.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use fluxgate_core::db::unix_millis;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::storage::{DatabaseError, Forward, STATUS_ACTIVE, STATUS_PAUSED};

use super::{Violation, grant_violation, user_violation};

/// Scope of one enforcement check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitCheck {
    User(i64),
    Grant { user_id: i64, tunnel_id: i64 },
}

type Pending = Arc<Mutex<HashSet<LimitCheck>>>;

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashSet<LimitCheck>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer side: schedules checks without blocking the ingestion path.
///
/// A check already waiting in the queue is not queued again.
#[derive(Clone)]
pub struct EnforcementQueue {
    tx: mpsc::Sender<LimitCheck>,
    pending: Pending,
}

pub struct EnforcementReceiver {
    rx: mpsc::Receiver<LimitCheck>,
    pending: Pending,
}

impl EnforcementQueue {
    pub fn channel(capacity: usize) -> (Self, EnforcementReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Pending::default();
        (
            Self {
                tx,
                pending: Arc::clone(&pending),
            },
            EnforcementReceiver { rx, pending },
        )
    }

    /// Returns `true` if the check is queued (now or already).
    pub fn schedule(&self, check: LimitCheck) -> bool {
        if !lock(&self.pending).insert(check) {
            return true;
        }
        if let Err(e) = self.tx.try_send(check) {
            lock(&self.pending).remove(&check);
            warn!(?check, error = %e, "Enforcement queue unavailable; check skipped");
            return false;
        }
        true
    }
}

impl EnforcementReceiver {
    pub async fn recv(&mut self) -> Option<LimitCheck> {
        let check = self.rx.recv().await?;
        lock(&self.pending).remove(&check);
        Some(check)
    }

    /// Checks still queued.
    pub fn queued(&self) -> usize {
        lock(&self.pending).len()
    }
}

pub struct LimitEnforcer {
    orchestrator: Arc<Orchestrator>,
}

impl LimitEnforcer {
    pub const fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Evaluate one scope and pause its active forwards on a violation.
    /// Returns how many forwards were paused.
    pub async fn check(&self, check: LimitCheck) -> Result<usize, DatabaseError> {
        let db = self.orchestrator.db();
        let now_ms = unix_millis();
        match check {
            LimitCheck::User(user_id) => {
                let user = db.get_user(user_id).await?;
                let Some(violation) = user_violation(&user, now_ms) else {
                    return Ok(0);
                };
                let forwards = db.list_forwards_by_user(user_id).await?;
                self.pause_all(&forwards, check, violation).await
            }
            LimitCheck::Grant { user_id, tunnel_id } => {
                let Some(grant) = db.find_user_tunnel(user_id, tunnel_id).await? else {
                    return Ok(0);
                };
                let Some(violation) = grant_violation(&grant, now_ms) else {
                    return Ok(0);
                };
                let forwards = db.list_forwards_by_user_tunnel(user_id, tunnel_id).await?;
                self.pause_all(&forwards, check, violation).await
            }
        }
    }

    /// Pause every active forward in `forwards`. Storage records the pause
    /// even when the agent could not be reached.
    pub(crate) async fn pause_all(
        &self,
        forwards: &[Forward],
        scope: LimitCheck,
        violation: Violation,
    ) -> Result<usize, DatabaseError> {
        let mut paused = 0;
        for forward in forwards.iter().filter(|f| f.status == STATUS_ACTIVE) {
            match self.orchestrator.plan_for(forward).await {
                Ok(plan) => {
                    self.orchestrator.sync_state(&plan, true, None).await;
                }
                Err(e) => {
                    warn!(forward_id = forward.id, error = %e, "No plan for forward; pausing in storage only");
                }
            }
            self.orchestrator
                .db()
                .set_forward_status(forward.id, STATUS_PAUSED, true)
                .await?;
            paused += 1;
        }
        if paused > 0 {
            info!(?scope, %violation, paused, "Forwards auto-paused");
        }
        Ok(paused)
    }

    /// Process checks until shutdown. Checks still queued at shutdown are
    /// dropped; the daily sweep re-evaluates everything.
    pub async fn run(&self, mut rx: EnforcementReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                check = rx.recv() => match check {
                    Some(check) => {
                        if let Err(e) = self.check(check).await {
                            warn!(?check, error = %e, "Limit check failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!(dropped = rx.queued(), "Limit enforcer stopping");
                    break;
                }
            }
        }
        info!("Limit enforcer stopped");
    }
}
