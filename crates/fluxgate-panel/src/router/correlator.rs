//! Request/response correlation over node sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use fluxgate_proto::{AgentReply, Command};

use crate::registry::{SendError, SessionRegistry};

use super::{AgentRpc, RpcError};

type PendingMap = HashMap<String, oneshot::Sender<AgentReply>>;

/// Turns directed sends into calls awaiting a correlated reply.
pub struct RpcCorrelator {
    registry: Arc<SessionRegistry>,
    pending: Arc<Mutex<PendingMap>>,
    call_timeout: Duration,
}

/// Removes a pending slot when the call finishes for any reason.
struct PendingSlot {
    pending: Arc<Mutex<PendingMap>>,
    request_id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

impl RpcCorrelator {
    pub fn new(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            call_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a command and wait for its reply.
    ///
    /// Any reply, OK or not, is returned as `Ok`; callers decide whether the
    /// agent's message is acceptable.
    pub async fn call(&self, node_id: i64, command: &Command) -> Result<AgentReply, RpcError> {
        let session = self
            .registry
            .get(node_id)
            .await
            .ok_or(RpcError::Offline(node_id))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = command
            .to_frame(Some(request_id.clone()))
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        let bytes = serde_json::to_vec(&frame).map_err(|e| RpcError::Encode(e.to_string()))?;

        // Register before sending so a fast reply cannot miss its slot.
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id.clone(), tx);
        let _slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            request_id: request_id.clone(),
        };

        session.send(&bytes).await.map_err(|e| match e {
            SendError::Offline(id) => RpcError::Offline(id),
            other => RpcError::SendFailed(other.to_string()),
        })?;
        debug!(node_id, request_id = %request_id, kind = command.kind(), "Command sent");

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::ResponseDropped(request_id)),
            Err(_) => {
                warn!(
                    node_id,
                    request_id = %request_id,
                    kind = command.kind(),
                    "Command timed out"
                );
                Err(RpcError::Timeout { node_id, request_id })
            }
        }
    }

    /// Route an inbound payload to its waiting caller.
    ///
    /// Returns `true` when the payload carried a correlation id and was
    /// consumed here, whether or not a caller was still waiting.
    pub fn dispatch_reply(&self, node_id: i64, payload: &[u8]) -> bool {
        let Some(request_id) = AgentReply::correlation_id(payload) else {
            return false;
        };

        let reply = match serde_json::from_slice::<AgentReply>(payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(node_id, request_id = %request_id, error = %e, "Malformed reply");
                return true;
            }
        };

        let slot = self.lock().remove(&request_id);
        match slot {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(node_id, request_id = %request_id, "Caller gave up before reply");
                }
            }
            None => {
                debug!(node_id, request_id = %request_id, "Unroutable reply discarded");
            }
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every pending slot; waiting callers see `ResponseDropped`.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

#[async_trait]
impl AgentRpc for RpcCorrelator {
    async fn call(&self, node_id: i64, command: Command) -> Result<AgentReply, RpcError> {
        Self::call(self, node_id, &command).await
    }
}
