// Identity key management

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroize;

use super::CryptoError;

/// KDF context string for deriving the identity key from the persisted seed.
/// Changing this re-keys every installation.
const IDENTITY_KDF_CONTEXT: &str = "peerlink v1 identity key 2026-03-11";

/// Ed25519 identity key pair, deterministically derived from a seed.
///
/// The seed is created once per installation and persisted; the key pair is
/// re-derived from it on every start and never rotated implicitly.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Derive the identity key pair from a persisted seed string
    pub fn from_seed(seed: &str) -> Self {
        let mut secret_key_bytes = blake3::derive_key(IDENTITY_KDF_CONTEXT, seed.as_bytes());
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key bytes (32 bytes)
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Identity hash (BLAKE3 of the public key, 32 bytes).
    /// This is the address other parties derive relay users and rooms from.
    pub fn identity_hash(&self) -> [u8; 32] {
        *blake3::hash(&self.public_key()).as_bytes()
    }

    /// Identity hash as hex
    pub fn identity_hash_hex(&self) -> String {
        hex::encode(self.identity_hash())
    }

    /// Sign data with the identity key
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a signature against a public key
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(
            public_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("bad public key length".to_string()))?,
        )
        .map_err(|_| CryptoError::InvalidKey("not a valid Ed25519 point".to_string()))?;

        let signature = Signature::from_bytes(
            signature
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("bad signature length".to_string()))?,
        );

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

/// Identity hash for an arbitrary public key (same derivation as
/// [`IdentityKeyPair::identity_hash`])
pub fn public_key_hash(public_key: &[u8]) -> [u8; 32] {
    *blake3::hash(public_key).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = IdentityKeyPair::from_seed("seed-1");
        let b = IdentityKeyPair::from_seed("seed-1");
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_distinct_seeds_distinct_keys() {
        let a = IdentityKeyPair::from_seed("seed-1");
        let b = IdentityKeyPair::from_seed("seed-2");
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = IdentityKeyPair::from_seed("seed");
        let data = b"login:deadbeef";

        let signature = keys.sign(data);
        assert!(IdentityKeyPair::verify(data, &signature, &keys.public_key()).unwrap());
        assert!(!IdentityKeyPair::verify(b"other data", &signature, &keys.public_key()).unwrap());
    }

    #[test]
    fn test_identity_hash_shape() {
        let keys = IdentityKeyPair::from_seed("seed");
        assert_eq!(keys.public_key_hex().len(), 64);
        assert_eq!(keys.identity_hash_hex().len(), 64);
        assert_eq!(keys.identity_hash(), public_key_hash(&keys.public_key()));
    }
}
