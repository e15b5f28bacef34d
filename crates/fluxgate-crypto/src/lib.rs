//! `Fluxgate` secure channel codec
//!
//! Every node shares a secret with the panel. Both sides derive the same
//! symmetric key from it and exchange JSON envelopes whose payload is sealed
//! with an AEAD, so commands that pause services or rewrite chains cannot be
//! forged or altered in transit.
//!
//! ## Crypto primitives
//!
//! - **Key**: SHA-256 of the node secret (32 bytes)
//! - **Encryption**: AES-256-GCM AEAD, fresh random 12-byte nonce per message
//! - **Framing**: `base64(nonce || ciphertext || tag)` inside `{encrypted, data, timestamp}`

pub mod channel;
pub mod envelope;
pub mod error;

pub use channel::{ChannelKey, NONCE_SIZE, TAG_SIZE};
pub use envelope::{Envelope, Opened, open_envelope, seal_envelope};
pub use error::CryptoError;
