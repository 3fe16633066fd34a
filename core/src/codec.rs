// JSON codec boundary — serialization with a size limit to prevent abuse

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Maximum encoded value size: 256 KB
/// This prevents memory exhaustion from malicious oversized payloads.
pub const MAX_ENCODED_SIZE: usize = 256 * 1024;

/// Serialize a value to a JSON string
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let encoded = serde_json::to_string(value)?;

    if encoded.len() > MAX_ENCODED_SIZE {
        bail!(
            "Encoded value too large: {} bytes (max {})",
            encoded.len(),
            MAX_ENCODED_SIZE
        );
    }

    Ok(encoded)
}

/// Deserialize a value from a JSON string
pub fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if raw.len() > MAX_ENCODED_SIZE {
        bail!(
            "Encoded value too large: {} bytes (max {})",
            raw.len(),
            MAX_ENCODED_SIZE
        );
    }

    Ok(serde_json::from_str(raw)?)
}
