// Crypto module — identity derivation, key exchange, authenticated encryption

pub mod keys;
pub mod session;

pub use keys::IdentityKeyPair;
pub use session::{
    decrypt, derive_session_key_pair, encrypt, generic_hash, looks_like_ciphertext, open_sealed,
    seal, to_session_private, to_session_public, Role, SessionKeyPair,
};

use thiserror::Error;

/// Crypto error types.
///
/// A `Decryption` failure is always recoverable by dropping the offending
/// payload — the relay channel is expected to carry foreign traffic.
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("decryption failed: invalid ciphertext or wrong key")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("ciphertext too short")]
    TooShort,
}
