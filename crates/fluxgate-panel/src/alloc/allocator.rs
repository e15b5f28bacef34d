//! Per-node port allocation.
//!
//! Picking a port is snapshot-then-decide: read the node's used ports, choose,
//! then write the owning row. A per-node lease serialises that sequence so two
//! administrative operations cannot both claim the same free port.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::storage::{Node, PanelDatabase, PortExclusion};

use super::PortError;
use super::port_range::PortRanges;

/// What the caller wants from a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWish {
    /// This port or an error.
    Exactly(u16),
    /// This port if it is still free and in range, else the lowest free one.
    Prefer(u16),
    /// The lowest free port.
    Any,
}

/// Holds the allocation locks of one or more nodes until dropped.
pub struct NodeLease {
    _guards: Vec<OwnedMutexGuard<()>>,
}

pub struct PortAllocator {
    db: PanelDatabase,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortAllocator {
    pub fn new(db: PanelDatabase) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn node_lock(&self, node_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(node_id).or_default())
    }

    /// Lock every listed node, in ascending id order so concurrent callers
    /// locking overlapping sets cannot deadlock.
    pub async fn lease(&self, node_ids: &[i64]) -> NodeLease {
        let ids: BTreeSet<i64> = node_ids.iter().copied().collect();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.node_lock(id).lock_owned().await);
        }
        NodeLease { _guards: guards }
    }

    /// Choose a port on `node`. The caller must hold a lease on it.
    ///
    /// `reserved` holds ports already picked on this node earlier in the same
    /// operation that are not yet written to storage.
    pub async fn pick(
        &self,
        node: &Node,
        wish: PortWish,
        exclude: PortExclusion,
        reserved: &BTreeSet<u16>,
    ) -> Result<u16, PortError> {
        let ranges = PortRanges::for_node(&node.port_ranges)?;
        let mut used = self.db.used_ports(node.id, exclude).await?;
        used.extend(reserved);

        let lowest = || {
            ranges
                .first_free(&used)
                .ok_or(PortError::NoCapacity { node_id: node.id })
        };
        let port = match wish {
            PortWish::Exactly(port) => {
                if !ranges.contains(port) {
                    return Err(PortError::OutOfRange {
                        port,
                        node_id: node.id,
                    });
                }
                if used.contains(&port) {
                    return Err(PortError::InUse(port));
                }
                port
            }
            PortWish::Prefer(port) if ranges.contains(port) && !used.contains(&port) => port,
            PortWish::Prefer(_) | PortWish::Any => lowest()?,
        };
        debug!(node_id = node.id, port, "Port allocated");
        Ok(port)
    }
}
