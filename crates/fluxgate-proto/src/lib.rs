//! Wire types for the panel ⇄ agent channel.
//!
//! - [`frame`]: command, reply and observer frames
//! - [`command`]: the closed set of agent commands
//! - [`service`]: service, chain, and limiter descriptors carried by commands
//! - [`report`]: traffic and configuration reports pushed by agents
//! - [`naming`]: the `{forward}_{user}_{userTunnel}` artifact naming scheme

pub mod command;
pub mod frame;
pub mod naming;
pub mod report;
pub mod service;

pub use command::{Command, CommandError, ProtocolFlags};
pub use frame::{AgentReply, CommandFrame, ObserverEvent};
pub use naming::{ArtifactKind, NameError, ServiceName};
pub use report::{ConfigReport, FlowReport};
