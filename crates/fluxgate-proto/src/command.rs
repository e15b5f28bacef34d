//! Closed set of commands the panel sends to agents.
//!
//! On the wire a command is `{ "type": <name>, "data": <payload> }`; the enum
//! uses serde's adjacent tagging so the variant name is the wire `type`.
//! Decoding an unrecognised `type` is an error, never a pass-through.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::CommandFrame;
use crate::service::{
    ChainConfig, ChainRef, ChainUpdate, LimiterConfig, LimiterRef, LimiterUpdate, ServiceConfig,
    ServiceSelection, TcpPingRequest,
};

/// Protocol toggles an agent exposes on its own management listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFlags {
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    AddService(Vec<ServiceConfig>),
    UpdateService(Vec<ServiceConfig>),
    DeleteService(ServiceSelection),
    PauseService(ServiceSelection),
    ResumeService(ServiceSelection),
    AddChains(ChainConfig),
    UpdateChains(ChainUpdate),
    DeleteChains(ChainRef),
    AddLimiters(LimiterConfig),
    UpdateLimiters(LimiterUpdate),
    DeleteLimiters(LimiterRef),
    TcpPing(TcpPingRequest),
    SetProtocol(ProtocolFlags),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Unknown or malformed command `{kind}`: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    /// Wire name of this command.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AddService(_) => "AddService",
            Self::UpdateService(_) => "UpdateService",
            Self::DeleteService(_) => "DeleteService",
            Self::PauseService(_) => "PauseService",
            Self::ResumeService(_) => "ResumeService",
            Self::AddChains(_) => "AddChains",
            Self::UpdateChains(_) => "UpdateChains",
            Self::DeleteChains(_) => "DeleteChains",
            Self::AddLimiters(_) => "AddLimiters",
            Self::UpdateLimiters(_) => "UpdateLimiters",
            Self::DeleteLimiters(_) => "DeleteLimiters",
            Self::TcpPing(_) => "TcpPing",
            Self::SetProtocol(_) => "SetProtocol",
        }
    }

    /// Wrap this command in a frame, optionally tagged with a correlation id.
    pub fn to_frame(&self, request_id: Option<String>) -> Result<CommandFrame, CommandError> {
        let mut tagged = serde_json::to_value(self).map_err(CommandError::Encode)?;
        let data = tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(CommandFrame {
            kind: self.kind().to_string(),
            data,
            request_id,
        })
    }

    /// Decode a frame back into a typed command.
    pub fn from_frame(frame: &CommandFrame) -> Result<Self, CommandError> {
        let tagged = serde_json::json!({ "type": frame.kind, "data": frame.data });
        serde_json::from_value(tagged).map_err(|source| CommandError::Decode {
            kind: frame.kind.clone(),
            source,
        })
    }
}
