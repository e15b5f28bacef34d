//! Plaintext frames carried inside the envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message text agents use for success.
pub const REPLY_OK: &str = "OK";

/// Outbound command `{type, data, requestId?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
}

impl CommandFrame {
    /// Acknowledgement sent when a node pushes its periodic system info.
    pub fn heartbeat_ack() -> Self {
        Self {
            kind: "call".to_string(),
            data: Value::Null,
            request_id: None,
        }
    }
}

/// Reply `{message, data, requestId}` correlated to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    #[serde(default = "ok_message")]
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn ok_message() -> String {
    REPLY_OK.to_string()
}

impl AgentReply {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            message: ok_message(),
            data: Value::Null,
            request_id: Some(request_id.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.message == REPLY_OK
    }

    /// The agent had no artifact by that name.
    pub fn is_not_found(&self) -> bool {
        self.message.to_ascii_lowercase().contains("not found")
    }

    /// Extract the correlation id from an arbitrary inbound payload.
    ///
    /// Returns `None` for non-JSON payloads, payloads without the field, and
    /// empty ids.
    pub fn correlation_id(payload: &[u8]) -> Option<String> {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(rename = "requestId")]
            request_id: Option<String>,
        }
        serde_json::from_slice::<Probe>(payload)
            .ok()
            .and_then(|p| p.request_id)
            .filter(|id| !id.is_empty())
    }
}

/// Event pushed to observer sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl ObserverEvent {
    pub fn presence(node_id: i64, online: bool) -> Self {
        Self {
            id: node_id,
            kind: "status".to_string(),
            data: Value::from(i32::from(online)),
        }
    }

    /// Raw node telemetry, forwarded verbatim as a string.
    pub fn info(node_id: i64, payload: &[u8]) -> Self {
        Self {
            id: node_id,
            kind: "info".to_string(),
            data: Value::String(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}
