//! Wire envelope `{ "encrypted": bool, "data": "...", "timestamp": ms }`.
//!
//! Outbound frames are always sealed. Inbound frames may still arrive as
//! bare JSON from older agents; those pass through untouched.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKey;
use crate::error::CryptoError;

/// Outer frame exchanged with agents.
///
/// Agents may omit `data` or `timestamp`; only `encrypted` marks a frame as
/// an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted: bool,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// An inbound frame read only as far as the envelope marker.
#[derive(Deserialize)]
struct Inbound {
    encrypted: Option<bool>,
    #[serde(default)]
    data: Option<String>,
}

/// Result of unwrapping an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// The frame was an encrypted envelope and authenticated successfully.
    Decrypted(Vec<u8>),
    /// The frame carried no encryption; bytes are used as-is.
    Plain(Vec<u8>),
}

impl Opened {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Decrypted(bytes) | Self::Plain(bytes) => bytes,
        }
    }

    pub const fn was_encrypted(&self) -> bool {
        matches!(self, Self::Decrypted(_))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Seal `payload` and return the serialized envelope text.
pub fn seal_envelope(key: &ChannelKey, payload: &[u8]) -> Result<String, CryptoError> {
    let envelope = Envelope {
        encrypted: true,
        data: STANDARD.encode(key.seal(payload)?),
        timestamp: now_millis(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Unwrap an inbound frame.
///
/// Any JSON object carrying `"encrypted": true` is an encrypted envelope: a
/// missing key, bad base64, or failed authentication is an error. An
/// unencrypted envelope yields its `data` field when present. Anything else
/// is returned verbatim.
pub fn open_envelope(key: Option<&ChannelKey>, raw: &[u8]) -> Result<Opened, CryptoError> {
    let Ok(inbound) = serde_json::from_slice::<Inbound>(raw) else {
        return Ok(Opened::Plain(raw.to_vec()));
    };

    match (inbound.encrypted, inbound.data) {
        (Some(true), data) => {
            let key = key.ok_or(CryptoError::MissingKey)?;
            let sealed = STANDARD.decode(data.unwrap_or_default().as_bytes())?;
            key.open(&sealed).map(Opened::Decrypted)
        }
        (Some(false), Some(data)) => Ok(Opened::Plain(data.into_bytes())),
        _ => Ok(Opened::Plain(raw.to_vec())),
    }
}
