//! Crypto error types.

/// Errors from the secure channel codec.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Ciphertext truncated: {actual} bytes, need at least {minimum}")]
    Truncated { minimum: usize, actual: usize },

    #[error("Encrypted envelope received but no channel key is available")]
    MissingKey,

    #[error("Invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
