// Pairing payload — what travels out of band (QR code, deeplink, copy/paste)

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::keys::public_key_hash;

use super::PairingError;

/// The out-of-band handshake payload. Either party can reconstruct the
/// other's relay address and session keys from this alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub id: String,
    pub name: String,
    pub version: String,
    pub public_key: String,
    pub relay_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

impl PairingPayload {
    /// Compact base58 string for out-of-band transfer
    pub fn to_base58(&self) -> Result<String, PairingError> {
        let encoded = codec::to_json(self).map_err(|e| PairingError::Payload(e.to_string()))?;
        Ok(bs58::encode(encoded.as_bytes()).into_string())
    }

    pub fn from_base58(raw: &str) -> Result<Self, PairingError> {
        let bytes = bs58::decode(raw.trim())
            .into_vec()
            .map_err(|e| PairingError::Payload(e.to_string()))?;
        let text =
            String::from_utf8(bytes).map_err(|e| PairingError::Payload(e.to_string()))?;
        codec::from_json(&text).map_err(|e| PairingError::Payload(e.to_string()))
    }
}

/// A remote party this installation knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub relay_server: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    #[serde(default)]
    pub is_paired: bool,
    /// Tombstone: removal is a transition, not deletion, until the
    /// transport layer has unsubscribed and persisted it
    #[serde(default)]
    pub is_removed: bool,
}

impl Peer {
    pub fn from_payload(payload: PairingPayload) -> Self {
        Self {
            id: payload.id,
            name: payload.name,
            public_key: payload.public_key,
            relay_server: payload.relay_server,
            version: payload.version,
            icon: payload.icon,
            app_url: payload.app_url,
            is_paired: false,
            is_removed: false,
        }
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], PairingError> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| PairingError::Payload(format!("bad peer public key: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| PairingError::Payload("bad peer public key length".to_string()))
    }

    /// BLAKE3 of the peer's public key — the address other relay
    /// identifiers derive from
    pub fn address_hash(&self) -> Result<[u8; 32], PairingError> {
        Ok(public_key_hash(&self.public_key_bytes()?))
    }

    pub fn address_hash_hex(&self) -> Result<String, PairingError> {
        Ok(hex::encode(self.address_hash()?))
    }
}
