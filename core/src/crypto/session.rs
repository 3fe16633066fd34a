// Session crypto: X25519 key exchange + XChaCha20-Poly1305
//
// Pairing flow:
// 1. Convert both parties' Ed25519 identity keys → X25519
// 2. ECDH: local_secret × remote_public → shared_secret
// 3. KDF: Blake3 XOF over (shared ‖ initiator_pub ‖ responder_pub) → 64 bytes
// 4. Split: initiator takes (receive, send), responder takes (send, receive)
//
// The two sides end up with complementary key pairs: what one side sends
// with, the other receives with. Message framing on the wire is
// hex(nonce ‖ ciphertext); sealed payloads (pairing responses) prepend the
// ephemeral public key.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// KDF context string for session key derivation.
/// Changing this breaks compatibility with every existing pairing.
const SESSION_KDF_CONTEXT: &str = "peerlink v1 session keys 2026-03-11";

/// KDF context string for sealed (pairing-response) payloads.
const SEAL_KDF_CONTEXT: &str = "peerlink v1 sealed payload 2026-03-11";

/// XChaCha20 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// Which side of the pairing this party is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The party that produced the out-of-band pairing payload
    Initiator,
    /// The party that scanned/received it and answers
    Responder,
}

/// Per-peer symmetric key pair, one key per direction
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyPair {
    pub send: [u8; 32],
    pub receive: [u8; 32],
}

/// Generic hash with parametrized output length (Blake3 XOF).
/// Used both for content hashing and relay address derivation.
pub fn generic_hash(data: &[u8], out_len: usize) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut out = vec![0u8; out_len];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Convert an Ed25519 signing key to an X25519 static secret.
///
/// Ed25519 and X25519 share the same underlying curve (Curve25519).
/// The conversion uses the clamped SHA-512 hash of the Ed25519 secret key,
/// which is how Ed25519 internally derives its scalar.
pub fn to_session_private(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 public key to an X25519 public key.
///
/// Uses the birational map from Ed25519 (twisted Edwards) to X25519
/// (Montgomery): u = (1 + y) / (1 - y) mod p.
pub fn to_session_public(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|_| CryptoError::InvalidKey("bad public key length".to_string()))?;

    let edwards_point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("not a valid Ed25519 point".to_string()))?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

/// Derive the per-peer session key pair.
///
/// The initiator's `send` key equals the responder's `receive` key and vice
/// versa, so both sides can derive independently from the out-of-band
/// pairing payload alone.
pub fn derive_session_key_pair(
    role: Role,
    local_signing_key: &SigningKey,
    remote_public_key: &[u8; 32],
) -> Result<SessionKeyPair, CryptoError> {
    let local_secret = to_session_private(local_signing_key);
    let local_public = X25519PublicKey::from(&local_secret);
    let remote_public = to_session_public(remote_public_key)?;

    let shared_secret = local_secret.diffie_hellman(&remote_public);

    // Transcript order is fixed to (initiator, responder) so both sides
    // hash identical bytes.
    let (initiator_public, responder_public) = match role {
        Role::Initiator => (local_public, remote_public),
        Role::Responder => (remote_public, local_public),
    };

    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
    hasher.update(shared_secret.as_bytes());
    hasher.update(initiator_public.as_bytes());
    hasher.update(responder_public.as_bytes());

    let mut okm = [0u8; 64];
    hasher.finalize_xof().fill(&mut okm);

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();

    // First half flows initiator ← responder, second half initiator → responder.
    let pair = match role {
        Role::Initiator => SessionKeyPair {
            receive: first,
            send: second,
        },
        Role::Responder => SessionKeyPair {
            send: first,
            receive: second,
        },
    };

    Ok(pair)
}

/// Encrypt a plaintext with a session key. Output is hex(nonce ‖ ciphertext).
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(hex::encode(framed))
}

/// Decrypt a hex(nonce ‖ ciphertext) payload with a session key.
/// Fails with `CryptoError::Decryption` on authentication-tag mismatch.
pub fn decrypt(payload: &str, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let framed = hex::decode(payload).map_err(|_| CryptoError::Decryption)?;
    if framed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort);
    }

    let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Cheap structural check before attempting decryption: hex-decodable and at
/// least nonce + tag long. Used to discard obviously-foreign relay text
/// without paying for a decryption attempt.
pub fn looks_like_ciphertext(payload: &str) -> bool {
    if payload.len() < 2 * (NONCE_LEN + TAG_LEN) || payload.len() % 2 != 0 {
        return false;
    }
    payload.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Encrypt a payload for a recipient identified only by their Ed25519
/// public key, using a fresh ephemeral X25519 key. Output is
/// hex(ephemeral_pub ‖ nonce ‖ ciphertext).
///
/// This is how a pairing response travels: the recipient has not derived
/// session keys for us yet, but can open this with just their identity key.
pub fn seal(recipient_public_key: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    let recipient_public = to_session_public(recipient_public_key)?;

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_public);

    let mut key = seal_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_public.as_bytes(),
    );

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Encryption)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    key.zeroize();

    let mut framed = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(ephemeral_public.as_bytes());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(hex::encode(framed))
}

/// Open a sealed payload with the local identity key
pub fn open_sealed(
    local_signing_key: &SigningKey,
    payload: &str,
) -> Result<Vec<u8>, CryptoError> {
    let framed = hex::decode(payload).map_err(|_| CryptoError::Decryption)?;
    if framed.len() < 32 + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort);
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&framed[..32]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let local_secret = to_session_private(local_signing_key);
    let local_public = X25519PublicKey::from(&local_secret);
    let shared_secret = local_secret.diffie_hellman(&ephemeral_public);

    let mut key = seal_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        local_public.as_bytes(),
    );

    let nonce_bytes = &framed[32..32 + NONCE_LEN];
    let ciphertext = &framed[32 + NONCE_LEN..];

    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Decryption)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption);
    key.zeroize();

    plaintext
}

fn seal_key(shared: &[u8], ephemeral_public: &[u8], recipient_public: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(SEAL_KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use proptest::prelude::*;

    #[test]
    fn test_session_keys_are_complementary() {
        let initiator = IdentityKeyPair::from_seed("initiator");
        let responder = IdentityKeyPair::from_seed("responder");

        let initiator_pair = derive_session_key_pair(
            Role::Initiator,
            initiator.signing_key(),
            &responder.public_key(),
        )
        .unwrap();
        let responder_pair = derive_session_key_pair(
            Role::Responder,
            responder.signing_key(),
            &initiator.public_key(),
        )
        .unwrap();

        assert_eq!(initiator_pair.send, responder_pair.receive);
        assert_eq!(initiator_pair.receive, responder_pair.send);
        assert_ne!(initiator_pair.send, initiator_pair.receive);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let payload = encrypt(b"hello", &key).unwrap();

        assert!(looks_like_ciphertext(&payload));
        assert_eq!(decrypt(&payload, &key).unwrap(), b"hello");
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let payload = encrypt(b"secret", &[1u8; 32]).unwrap();
        let result = decrypt(&payload, &[2u8; 32]);
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_decrypt_truncated_fails() {
        let payload = encrypt(b"secret", &[1u8; 32]).unwrap();
        let truncated = &payload[..2 * NONCE_LEN];
        assert!(decrypt(truncated, &[1u8; 32]).is_err());
    }

    #[test]
    fn test_looks_like_ciphertext_rejects_noise() {
        assert!(!looks_like_ciphertext("hello peers"));
        assert!(!looks_like_ciphertext("abcdef"));
        // Hex-looking but too short for nonce + tag
        assert!(!looks_like_ciphertext(&"ab".repeat(NONCE_LEN)));
        // Odd length never decodes
        assert!(!looks_like_ciphertext(&"a".repeat(2 * (NONCE_LEN + TAG_LEN) + 1)));
    }

    #[test]
    fn test_generic_hash_lengths() {
        let short = generic_hash(b"addr", 8);
        let long = generic_hash(b"addr", 32);
        assert_eq!(short.len(), 8);
        assert_eq!(long.len(), 32);
        // XOF: the short output is a prefix of the long one
        assert_eq!(short[..], long[..8]);
    }

    #[test]
    fn test_sealed_roundtrip() {
        let recipient = IdentityKeyPair::from_seed("wallet");
        let payload = seal(&recipient.public_key(), b"pairing response").unwrap();

        assert!(looks_like_ciphertext(&payload));
        let opened = open_sealed(recipient.signing_key(), &payload).unwrap();
        assert_eq!(opened, b"pairing response");
    }

    #[test]
    fn test_sealed_wrong_recipient_fails() {
        let recipient = IdentityKeyPair::from_seed("wallet");
        let other = IdentityKeyPair::from_seed("someone else");

        let payload = seal(&recipient.public_key(), b"pairing response").unwrap();
        assert!(open_sealed(other.signing_key(), &payload).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_plaintext(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = [9u8; 32];
            let payload = encrypt(&plaintext, &key).unwrap();
            prop_assert_eq!(decrypt(&payload, &key).unwrap(), plaintext);
        }

        #[test]
        fn prop_complementary_for_any_seeds(a in "[a-z]{1,16}", b in "[A-Z]{1,16}") {
            let initiator = IdentityKeyPair::from_seed(&a);
            let responder = IdentityKeyPair::from_seed(&b);

            let initiator_pair = derive_session_key_pair(
                Role::Initiator,
                initiator.signing_key(),
                &responder.public_key(),
            ).unwrap();
            let responder_pair = derive_session_key_pair(
                Role::Responder,
                responder.signing_key(),
                &initiator.public_key(),
            ).unwrap();

            prop_assert_eq!(initiator_pair.send, responder_pair.receive);
            prop_assert_eq!(initiator_pair.receive, responder_pair.send);
        }
    }
}
