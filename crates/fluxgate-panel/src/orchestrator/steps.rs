//! Ordered remote steps with reverse-order rollback.

use tracing::{debug, warn};

use fluxgate_proto::Command;

use crate::router::{AgentRpc, RpcError};

use super::error::OrchestrationError;

/// One remote change and the command that undoes it.
#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub node_id: i64,
    pub apply: Command,
    pub undo: Option<Command>,
}

impl Step {
    pub fn new(label: impl Into<String>, node_id: i64, apply: Command, undo: Option<Command>) -> Self {
        Self {
            label: label.into(),
            node_id,
            apply,
            undo,
        }
    }
}

/// Apply steps in order. On the first failure, undo every step already
/// applied (newest first) and return that failure.
///
/// A step whose outcome is unknown (timeout) is undone as well, since the
/// agent may have applied it.
pub async fn run_steps(rpc: &dyn AgentRpc, steps: &[Step]) -> Result<(), OrchestrationError> {
    for (index, step) in steps.iter().enumerate() {
        match rpc.execute(step.node_id, step.apply.clone()).await {
            Ok(_) => debug!(node_id = step.node_id, step = %step.label, "Step applied"),
            Err(source) => {
                let applied = if source.is_ambiguous() {
                    &steps[..=index]
                } else {
                    &steps[..index]
                };
                warn!(
                    node_id = step.node_id,
                    step = %step.label,
                    error = %source,
                    rollback = applied.len(),
                    "Step failed; rolling back"
                );
                rollback(rpc, applied).await;
                return Err(OrchestrationError::Step {
                    step: step.label.clone(),
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Undo `applied` newest-first. Failures are logged and never abort the unwind.
pub async fn rollback(rpc: &dyn AgentRpc, applied: &[Step]) {
    for step in applied.iter().rev() {
        let Some(undo) = step.undo.clone() else {
            continue;
        };
        if let Err(e) = rpc.execute(step.node_id, undo).await {
            warn!(
                node_id = step.node_id,
                step = %step.label,
                error = %e,
                "Rollback step failed"
            );
        }
    }
}

/// Update in place, creating instead when the agent has no such artifact.
pub async fn update_or_create(
    rpc: &dyn AgentRpc,
    label: &str,
    node_id: i64,
    update: Command,
    create: Command,
) -> Result<(), OrchestrationError> {
    match rpc.execute(node_id, update).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(node_id, step = label, "Artifact missing on agent; creating");
            rpc.execute(node_id, create)
                .await
                .map(drop)
                .map_err(|source| OrchestrationError::Step {
                    step: label.to_string(),
                    source,
                })
        }
        Err(source) => Err(OrchestrationError::Step {
            step: label.to_string(),
            source,
        }),
    }
}

/// Run a removal, treating "not found" as already removed.
pub async fn remove(rpc: &dyn AgentRpc, node_id: i64, command: Command) -> Result<(), RpcError> {
    match rpc.execute(node_id, command).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
