//! SQLite storage for the Fluxgate panel.
//!
//! Persists nodes, tunnels and their hops, forwards, users, per-tunnel
//! grants, speed limits, and the hourly traffic ledger.

mod db;
mod models;
mod queries;
mod queries_forward;
mod queries_traffic;


pub use db::{DatabaseError, PanelDatabase};
pub use models::*;
pub use queries::{NewHop, NewNode, NewTunnel, NewUser, NewUserTunnel};
pub use queries_forward::{ForwardParams, PortExclusion};
pub use queries_traffic::{FlowIncrement, HistoryIncrement, TrafficBatch};
