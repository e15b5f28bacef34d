//! Live session tracking for nodes and observers.

mod session;

pub use session::{NodeRuntime, NodeSession, SendError, SessionRegistry};
