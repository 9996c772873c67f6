//! Crypto envelope for secret values at rest.
//!
//! Uses:
//! - Blake3 keyed derivation: master key + per-value salt -> per-value key
//! - ChaCha20-Poly1305 for authenticated encryption
//! - Base64 for the stored wire form (nonce prepended to ciphertext)
//!
//! The master key is supplied out-of-band and held only in memory; it is
//! zeroized on drop. Any malformed ciphertext/salt pair or wrong key fails
//! deterministically with `CryptoError::DecryptionFailed` (AEAD tag), never
//! silent corruption.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::CryptoConfig;

/// Method tag recorded on every secret row, so a future scheme change can
/// coexist with already-encrypted values.
pub const ENCRYPTION_METHOD: &str = "chacha20poly1305.v1";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_DERIVE_CONTEXT: &str = "arcanum secret envelope v1";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Master key not configured")]
    MasterKeyMissing,

    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid salt length")]
    InvalidSalt,

    #[error("Ciphertext too short")]
    CiphertextTruncated,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decrypted value is not valid UTF-8")]
    InvalidPlaintext,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Hash a plaintext value for the change log (blake3 hex).
/// Change logs store only these hashes, never the plaintext.
pub fn hash_value(plaintext: &str) -> String {
    blake3::hash(plaintext.as_bytes()).to_hex().to_string()
}

/// Symmetric cipher over the shared master key.
///
/// Each value is encrypted under a key derived from the master key and a
/// random per-value salt, so two secrets with the same plaintext never share
/// ciphertext and a leaked per-value key exposes only that value.
pub struct SecretCipher {
    /// 32-byte key derived once from the configured master key
    master: Zeroizing<[u8; 32]>,
}

impl SecretCipher {
    /// Build a cipher from a raw master key string.
    ///
    /// Fails with `MasterKeyMissing` when the key is absent or empty; callers
    /// must not fall back to an unencrypted mode.
    pub fn new(master_key: &str) -> CryptoResult<Self> {
        if master_key.is_empty() {
            return Err(CryptoError::MasterKeyMissing);
        }
        let master = Zeroizing::new(blake3::derive_key(
            KEY_DERIVE_CONTEXT,
            master_key.as_bytes(),
        ));
        Ok(Self { master })
    }

    /// Build a cipher from the crypto section of the app config.
    pub fn from_config(config: &CryptoConfig) -> CryptoResult<Self> {
        Self::new(&config.master_key)
    }

    fn value_key(&self, salt: &[u8]) -> chacha20poly1305::Key {
        let derived = blake3::keyed_hash(&self.master, salt);
        chacha20poly1305::Key::from(*derived.as_bytes())
    }

    /// Encrypt a plaintext value.
    ///
    /// Returns `(ciphertext_b64, salt_b64)`; the nonce is prepended to the
    /// ciphertext before encoding.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<(String, String)> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = ChaCha20Poly1305::new(&self.value_key(&salt));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);

        Ok((BASE64.encode(framed), BASE64.encode(salt)))
    }

    /// Decrypt a stored `(ciphertext_b64, salt_b64)` pair.
    pub fn decrypt(&self, ciphertext_b64: &str, salt_b64: &str) -> CryptoResult<String> {
        let salt = BASE64.decode(salt_b64)?;
        if salt.len() != SALT_LEN {
            return Err(CryptoError::InvalidSalt);
        }

        let framed = BASE64.decode(ciphertext_b64)?;
        if framed.len() <= NONCE_LEN {
            return Err(CryptoError::CiphertextTruncated);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = ChaCha20Poly1305::new(&self.value_key(&salt));
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidPlaintext)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}
