//! In-memory registry of live node and observer sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use fluxgate_crypto::{ChannelKey, CryptoError, seal_envelope};
use fluxgate_proto::ObserverEvent;

use crate::storage::{NODE_OFFLINE, PanelDatabase};

/// Errors from a directed send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Node {0} is offline")]
    Offline(i64),

    #[error("Failed to seal frame for node {node_id}: {source}")]
    Seal {
        node_id: i64,
        #[source]
        source: CryptoError,
    },

    #[error("Connection to node {0} closed")]
    Closed(i64),

    #[error("Outbound queue of node {0} is full")]
    Backlogged(i64),
}

/// Runtime fields a node reports when it connects. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRuntime {
    pub version: Option<String>,
    pub http: Option<i64>,
    pub tls: Option<i64>,
    pub socks: Option<i64>,
}

/// A live connection to one node.
///
/// Outbound frames go through `outbound`, drained by a single writer task
/// that owns the socket sink.
pub struct NodeSession {
    pub node_id: i64,
    session_id: u64,
    key: ChannelKey,
    outbound: mpsc::Sender<String>,
    valid: AtomicBool,
    kick: watch::Sender<bool>,
}

impl NodeSession {
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Seal `payload` and queue it for the writer task.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        if !self.is_valid() {
            return Err(SendError::Offline(self.node_id));
        }
        let text = seal_envelope(&self.key, payload).map_err(|source| SendError::Seal {
            node_id: self.node_id,
            source,
        })?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| SendError::Closed(self.node_id))
    }

    /// Seal `payload` and queue it only if the writer has room.
    pub fn try_send(&self, payload: &[u8]) -> Result<(), SendError> {
        if !self.is_valid() {
            return Err(SendError::Offline(self.node_id));
        }
        let text = seal_envelope(&self.key, payload).map_err(|source| SendError::Seal {
            node_id: self.node_id,
            source,
        })?;
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backlogged(self.node_id),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.node_id),
        })
    }

    /// Resolves once this session has been superseded or closed by the registry.
    pub async fn closed(&self) {
        let mut rx = self.kick.subscribe();
        // The sender lives in `self`, so `wait_for` only ends on a kick.
        let _ = rx.wait_for(|kicked| *kicked).await;
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.kick.send_replace(true);
    }
}

/// A connected observer. Events it cannot keep up with are dropped.
struct ObserverSession {
    tx: mpsc::Sender<String>,
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    nodes: RwLock<HashMap<i64, Arc<NodeSession>>>,
    observers: RwLock<HashMap<u64, ObserverSession>>,
    next_id: AtomicU64,
    db: PanelDatabase,
    /// Held across each status write and its presence event.
    presence: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(db: PanelDatabase) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            db,
            presence: Mutex::new(()),
        }
    }

    /// Install a node session, closing any live session for the same node.
    pub async fn register_node(
        &self,
        node_id: i64,
        key: ChannelKey,
        outbound: mpsc::Sender<String>,
        runtime: NodeRuntime,
    ) -> Arc<NodeSession> {
        let (kick, _) = watch::channel(false);
        let session = Arc::new(NodeSession {
            node_id,
            session_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            outbound,
            valid: AtomicBool::new(true),
            kick,
        });

        let previous = self
            .nodes
            .write()
            .await
            .insert(node_id, Arc::clone(&session));
        if let Some(old) = previous {
            old.invalidate();
            info!(node_id, old_session = old.session_id(), "Replaced existing node session");
        }
        info!(node_id, session = session.session_id(), "Node session registered");

        let _presence = self.presence.lock().await;
        if let Err(e) = self
            .db
            .update_node_runtime(
                node_id,
                runtime.version.as_deref(),
                runtime.http,
                runtime.tls,
                runtime.socks,
            )
            .await
        {
            warn!(node_id, error = %e, "Failed to persist node online status");
        }
        self.broadcast(&ObserverEvent::presence(node_id, true)).await;

        session
    }

    /// Remove a node session if it is still the current one for its node.
    ///
    /// Returns `false` for a stale unregister racing a newer registration.
    pub async fn unregister_node(&self, session: &NodeSession) -> bool {
        if !self.detach(session).await {
            return false;
        }
        self.persist_offline(session.node_id).await;
        true
    }

    async fn detach(&self, session: &NodeSession) -> bool {
        let removed = {
            let mut nodes = self.nodes.write().await;
            match nodes.get(&session.node_id) {
                Some(current) if current.session_id == session.session_id => {
                    nodes.remove(&session.node_id)
                }
                _ => None,
            }
        };
        session.invalidate();

        if removed.is_none() {
            debug!(
                node_id = session.node_id,
                session = session.session_id,
                "Ignoring stale unregister"
            );
            return false;
        }
        info!(node_id = session.node_id, "Node session unregistered");
        true
    }

    /// Mark a node offline unless a newer session took over in the meantime.
    async fn persist_offline(&self, node_id: i64) {
        let _presence = self.presence.lock().await;
        if self.nodes.read().await.contains_key(&node_id) {
            debug!(node_id, "Node reconnected before its offline status was written");
            return;
        }
        if let Err(e) = self.db.set_node_status(node_id, NODE_OFFLINE).await {
            warn!(node_id, error = %e, "Failed to persist node offline status");
        }
        self.broadcast(&ObserverEvent::presence(node_id, false)).await;
    }

    /// Live session for a node, if any.
    pub async fn get(&self, node_id: i64) -> Option<Arc<NodeSession>> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .filter(|s| s.is_valid())
            .cloned()
    }

    pub async fn is_online(&self, node_id: i64) -> bool {
        self.get(node_id).await.is_some()
    }

    pub async fn online_nodes(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.nodes.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Send a plaintext frame to a node through its session.
    pub async fn send(&self, node_id: i64, payload: &[u8]) -> Result<(), SendError> {
        let session = self.get(node_id).await.ok_or(SendError::Offline(node_id))?;
        session.send(payload).await
    }

    /// Add an observer; returns its id for `unregister_observer`.
    pub async fn register_observer(&self, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .await
            .insert(id, ObserverSession { tx });
        debug!(observer = id, "Observer registered");
        id
    }

    pub async fn unregister_observer(&self, id: u64) {
        if self.observers.write().await.remove(&id).is_some() {
            debug!(observer = id, "Observer unregistered");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Fan an event out to every observer without waiting on any of them.
    pub async fn broadcast(&self, event: &ObserverEvent) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode observer event");
                return;
            }
        };
        for (id, observer) in self.observers.read().await.iter() {
            if let Err(e) = observer.tx.try_send(text.clone()) {
                debug!(observer = id, error = %e, "Dropped observer event");
            }
        }
    }

    /// Close every node session. Used at shutdown.
    pub async fn close_all(&self) {
        let _presence = self.presence.lock().await;
        let sessions: Vec<_> = self.nodes.write().await.drain().collect();
        for (node_id, session) in sessions {
            session.invalidate();
            if let Err(e) = self.db.set_node_status(node_id, NODE_OFFLINE).await {
                warn!(node_id, error = %e, "Failed to persist node offline status");
            }
        }
    }
}
