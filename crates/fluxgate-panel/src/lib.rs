//! Fluxgate Panel Library
//!
//! Control plane for a fleet of proxy nodes:
//! - Session registry and encrypted agent channel
//! - Correlated RPC to agents
//! - Traffic ingestion, billing, and batched accounting
//! - Port and chain allocation for tunnels and forwards
//! - Quota, expiry, and status enforcement
//! - Reconciliation of agent state after reconnects

pub mod alloc;
pub mod auth;
pub mod http;
pub mod limits;
pub mod orchestrator;
pub mod panel;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod storage;
pub mod traffic;

pub use panel::Panel;
