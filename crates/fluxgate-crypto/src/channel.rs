//! Per-node channel key.
//!
//! The key is a pure function of the node secret, so the panel can rebuild it
//! on every reconnect without persisting anything beyond the secret itself.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// GCM standard nonce size.
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Symmetric key derived from a node's shared secret.
#[derive(Clone)]
pub struct ChannelKey {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl ChannelKey {
    /// Derive the channel key: `SHA-256(secret)`.
    pub fn derive(secret: &str) -> Self {
        let mut key_bytes: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        // Log-safe identifier: a hash of the key, never the key itself.
        let fingerprint = hex::encode(&Sha256::digest(key_bytes)[..6]);
        key_bytes.zeroize();

        Self {
            cipher,
            fingerprint,
        }
    }

    /// Short hex identifier safe to print in logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a buffer produced by [`ChannelKey::seal`].
    ///
    /// Fails on short input or any authentication failure; no partial
    /// plaintext is ever returned.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let minimum = NONCE_SIZE + TAG_SIZE;
        if sealed.len() < minimum {
            return Err(CryptoError::Truncated {
                minimum,
                actual: sealed.len(),
            });
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = ChannelKey::derive("node-secret");
        let sealed = key.seal(b"Hello, encrypted world!").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), b"Hello, encrypted world!");
    }

    #[test]
    fn opens_frame_sealed_by_a_deployed_agent() {
        // AES-256-GCM, key = SHA-256("node-secret"), nonce 00..0b, base64(nonce || ct || tag).
        let sealed = base64::engine::general_purpose::STANDARD
            .decode("AAECAwQFBgcICQoLLCXgXPMQAjvSyyGHGUMYPwwtG1YjEV/+Q3stLv+mDuNdWwwrnA==")
            .unwrap();
        let key = ChannelKey::derive("node-secret");
        assert_eq!(key.open(&sealed).unwrap(), br#"{"memory_usage":12.5}"#);
        assert!(ChannelKey::derive("other-secret").open(&sealed).is_err());
    }

    #[test]
    fn same_secret_derives_interoperable_keys() {
        let a = ChannelKey::derive("shared");
        let b = ChannelKey::derive("shared");
        let sealed = a.seal(b"test").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"test");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_secret_fails_closed() {
        let sealed = ChannelKey::derive("right").seal(b"secret data").unwrap();
        let result = ChannelKey::derive("wrong").open(&sealed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = ChannelKey::derive("s");
        let mut sealed = key.seal(b"secret data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn tampered_nonce_fails() {
        let key = ChannelKey::derive("s");
        let mut sealed = key.seal(b"secret data").unwrap();
        sealed[0] ^= 0x01;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn truncated_input_reports_lengths() {
        let key = ChannelKey::derive("s");
        let result = key.open(&[0u8; 20]);
        assert!(matches!(
            result,
            Err(CryptoError::Truncated {
                minimum: 28,
                actual: 20
            })
        ));
    }

    #[test]
    fn empty_plaintext_is_sealed() {
        let key = ChannelKey::derive("s");
        let sealed = key.seal(b"").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        assert!(key.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn nonces_are_fresh_per_message() {
        let key = ChannelKey::derive("s");
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..500 {
            let sealed = key.seal(b"x").unwrap();
            assert!(nonces.insert(sealed[..NONCE_SIZE].to_vec()), "nonce reuse");
        }
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = ChannelKey::derive("super-secret");
        let printed = format!("{key:?}");
        assert!(printed.contains(key.fingerprint()));
        assert!(!printed.contains("super-secret"));
    }
}
