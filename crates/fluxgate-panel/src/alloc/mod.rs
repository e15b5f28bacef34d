//! Port allocation on node port pools and the self-loop guard.

mod allocator;
mod port_range;
mod self_loop;

pub use allocator::{NodeLease, PortAllocator, PortWish};
pub use port_range::{DEFAULT_PORT_RANGE, PortRanges};
pub use self_loop::{SelfLoop, check_self_loop, split_host_port};

use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Invalid port range {0}")]
    InvalidRange(String),

    #[error("Port range is empty")]
    Empty,

    #[error("No free port left on node {node_id}")]
    NoCapacity { node_id: i64 },

    #[error("port {0} in use")]
    InUse(u16),

    #[error("Port {port} is outside the allowed range of node {node_id}")]
    OutOfRange { port: u16, node_id: i64 },

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}
