// Version-tagged wire envelopes
//
// Three envelope generations coexist on the wire. Decoding peeks the
// "version" discriminant first and routes to exactly one shape — never
// trial-and-error parsing. Unknown or newer majors use the newest known
// shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{AppIdentity, Content, DomainMessage};
use crate::codec;

/// Newest envelope generation this build understands
pub const NEWEST_MAJOR: u16 = 3;

#[derive(Debug, Clone, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

/// First generation: flat, no sender field — the transport has to supply
/// the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeV1 {
    pub version: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Second generation: V1 plus an explicit sender id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeV2 {
    pub version: String,
    pub id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Third generation: header plus a nested, tagged message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeV3 {
    pub version: String,
    pub id: String,
    pub sender_id: String,
    pub message: Content,
}

#[derive(Debug, Clone)]
pub enum VersionedEnvelope {
    V1(EnvelopeV1),
    V2(EnvelopeV2),
    V3(EnvelopeV3),
}

/// Numeric major of a version string ("2", "2.0.1", ...). Anything
/// unparseable counts as newer-than-known.
pub fn major_of(version: &str) -> u16 {
    version
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .unwrap_or(NEWEST_MAJOR)
}

#[derive(Deserialize)]
struct VersionProbe {
    version: String,
}

impl VersionedEnvelope {
    /// Produce the envelope shape the peer's negotiated version selects.
    /// Unrecognized/newer majors fall back to the newest known shape.
    pub fn from_domain(message: &DomainMessage) -> Self {
        match major_of(&message.version) {
            1 => VersionedEnvelope::V1(EnvelopeV1::from_domain(message)),
            2 => VersionedEnvelope::V2(EnvelopeV2::from_domain(message)),
            _ => VersionedEnvelope::V3(EnvelopeV3::from_domain(message)),
        }
    }

    /// Map back to a domain message. V1 envelopes have no sender field, so
    /// the transport-observed origin fills in.
    pub fn to_domain(self, fallback_sender: &str) -> Result<DomainMessage, EnvelopeError> {
        match self {
            VersionedEnvelope::V1(envelope) => envelope.to_domain(fallback_sender),
            VersionedEnvelope::V2(envelope) => envelope.to_domain(),
            VersionedEnvelope::V3(envelope) => Ok(envelope.to_domain()),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let encoded = match self {
            VersionedEnvelope::V1(envelope) => codec::to_json(envelope),
            VersionedEnvelope::V2(envelope) => codec::to_json(envelope),
            VersionedEnvelope::V3(envelope) => codec::to_json(envelope),
        };
        encoded.map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Decode by peeking the version discriminant first
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let probe: VersionProbe =
            codec::from_json(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let envelope = match major_of(&probe.version) {
            1 => VersionedEnvelope::V1(
                codec::from_json(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?,
            ),
            2 => VersionedEnvelope::V2(
                codec::from_json(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?,
            ),
            _ => VersionedEnvelope::V3(
                codec::from_json(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?,
            ),
        };
        Ok(envelope)
    }
}

/// The flat (V1/V2) representation of a content value
fn flatten(content: &Content) -> (&'static str, FlatFields) {
    let mut fields = FlatFields::default();
    let kind = match content {
        Content::PermissionRequest { app, payload } => {
            fields.app = Some(app.clone());
            fields.payload = Some(payload.clone());
            "permission_request"
        }
        Content::Request { payload } => {
            fields.payload = Some(payload.clone());
            "request"
        }
        Content::PermissionResponse {
            public_key,
            network,
            payload,
        } => {
            fields.public_key = Some(public_key.clone());
            fields.network = Some(network.clone());
            fields.payload = Some(payload.clone());
            "permission_response"
        }
        Content::Response { payload } => {
            fields.payload = Some(payload.clone());
            "response"
        }
        Content::Acknowledge => "acknowledge",
        Content::Error { description } => {
            fields.description = Some(description.clone());
            "error"
        }
        Content::Disconnect => "disconnect",
    };
    (kind, fields)
}

#[derive(Default)]
struct FlatFields {
    payload: Option<String>,
    app: Option<AppIdentity>,
    public_key: Option<String>,
    network: Option<String>,
    description: Option<String>,
}

fn unflatten(
    kind: &str,
    payload: Option<String>,
    app: Option<AppIdentity>,
    public_key: Option<String>,
    network: Option<String>,
    description: Option<String>,
) -> Result<Content, EnvelopeError> {
    let missing = |field: &str| EnvelopeError::Malformed(format!("missing field {field}"));
    let content = match kind {
        "permission_request" => Content::PermissionRequest {
            app: app.ok_or_else(|| missing("app"))?,
            payload: payload.ok_or_else(|| missing("payload"))?,
        },
        "request" => Content::Request {
            payload: payload.ok_or_else(|| missing("payload"))?,
        },
        "permission_response" => Content::PermissionResponse {
            public_key: public_key.ok_or_else(|| missing("public_key"))?,
            network: network.ok_or_else(|| missing("network"))?,
            payload: payload.ok_or_else(|| missing("payload"))?,
        },
        "response" => Content::Response {
            payload: payload.ok_or_else(|| missing("payload"))?,
        },
        "acknowledge" => Content::Acknowledge,
        "error" => Content::Error {
            description: description.ok_or_else(|| missing("description"))?,
        },
        "disconnect" => Content::Disconnect,
        other => return Err(EnvelopeError::UnknownKind(other.to_string())),
    };
    Ok(content)
}

impl EnvelopeV1 {
    pub fn from_domain(message: &DomainMessage) -> Self {
        let (kind, fields) = flatten(&message.content);
        Self {
            version: message.version.clone(),
            id: message.id.clone(),
            kind: kind.to_string(),
            payload: fields.payload,
            app: fields.app,
            public_key: fields.public_key,
            network: fields.network,
            description: fields.description,
        }
    }

    pub fn to_domain(self, fallback_sender: &str) -> Result<DomainMessage, EnvelopeError> {
        Ok(DomainMessage {
            id: self.id,
            version: self.version,
            sender_id: fallback_sender.to_string(),
            content: unflatten(
                &self.kind,
                self.payload,
                self.app,
                self.public_key,
                self.network,
                self.description,
            )?,
        })
    }
}

impl EnvelopeV2 {
    pub fn from_domain(message: &DomainMessage) -> Self {
        let (kind, fields) = flatten(&message.content);
        Self {
            version: message.version.clone(),
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            kind: kind.to_string(),
            payload: fields.payload,
            app: fields.app,
            public_key: fields.public_key,
            network: fields.network,
            description: fields.description,
        }
    }

    pub fn to_domain(self) -> Result<DomainMessage, EnvelopeError> {
        Ok(DomainMessage {
            id: self.id,
            version: self.version,
            sender_id: self.sender_id,
            content: unflatten(
                &self.kind,
                self.payload,
                self.app,
                self.public_key,
                self.network,
                self.description,
            )?,
        })
    }
}

impl EnvelopeV3 {
    pub fn from_domain(message: &DomainMessage) -> Self {
        Self {
            version: message.version.clone(),
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            message: message.content.clone(),
        }
    }

    pub fn to_domain(self) -> DomainMessage {
        DomainMessage {
            id: self.id,
            version: self.version,
            sender_id: self.sender_id,
            content: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: &str) -> DomainMessage {
        DomainMessage {
            id: "msg-1".to_string(),
            version: version.to_string(),
            sender_id: "abc123".to_string(),
            content: Content::Request {
                payload: "{\"op\":\"transfer\"}".to_string(),
            },
        }
    }

    #[test]
    fn test_major_parsing() {
        assert_eq!(major_of("1"), 1);
        assert_eq!(major_of("2.0.0"), 2);
        assert_eq!(major_of("3.1"), 3);
        assert_eq!(major_of("banana"), NEWEST_MAJOR);
    }

    #[test]
    fn test_version_selects_shape() {
        assert!(matches!(
            VersionedEnvelope::from_domain(&sample("1")),
            VersionedEnvelope::V1(_)
        ));
        assert!(matches!(
            VersionedEnvelope::from_domain(&sample("2.0.0")),
            VersionedEnvelope::V2(_)
        ));
        assert!(matches!(
            VersionedEnvelope::from_domain(&sample("3")),
            VersionedEnvelope::V3(_)
        ));
    }

    #[test]
    fn test_newer_major_falls_back_to_newest_shape() {
        assert!(matches!(
            VersionedEnvelope::from_domain(&sample("7")),
            VersionedEnvelope::V3(_)
        ));
    }

    #[test]
    fn test_decode_routes_on_peeked_version() {
        let raw = VersionedEnvelope::from_domain(&sample("2.0.0"))
            .encode()
            .unwrap();
        assert!(matches!(
            VersionedEnvelope::decode(&raw).unwrap(),
            VersionedEnvelope::V2(_)
        ));
    }

    #[test]
    fn test_v1_roundtrip_uses_fallback_sender() {
        let message = sample("1");
        let raw = VersionedEnvelope::from_domain(&message).encode().unwrap();
        let decoded = VersionedEnvelope::decode(&raw)
            .unwrap()
            .to_domain("observed-origin")
            .unwrap();

        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.sender_id, "observed-origin");
        assert_eq!(decoded.content, message.content);
    }

    #[test]
    fn test_v3_roundtrip_preserves_sender() {
        let message = DomainMessage {
            id: "msg-2".to_string(),
            version: "3".to_string(),
            sender_id: "walletside".to_string(),
            content: Content::PermissionResponse {
                public_key: "deadbeef".to_string(),
                network: "mainnet".to_string(),
                payload: "{}".to_string(),
            },
        };

        let raw = VersionedEnvelope::from_domain(&message).encode().unwrap();
        let decoded = VersionedEnvelope::decode(&raw)
            .unwrap()
            .to_domain("ignored")
            .unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_v2_unknown_kind_fails() {
        let raw = "{\"version\":\"2\",\"id\":\"x\",\"sender_id\":\"s\",\"type\":\"frobnicate\"}";
        let result = VersionedEnvelope::decode(raw).unwrap().to_domain("s");
        assert!(matches!(result, Err(EnvelopeError::UnknownKind(_))));
    }

    #[test]
    fn test_permission_request_flat_roundtrip() {
        let message = DomainMessage {
            id: "msg-3".to_string(),
            version: "2.0.0".to_string(),
            sender_id: "dappside".to_string(),
            content: Content::PermissionRequest {
                app: AppIdentity {
                    name: "Example DEX".to_string(),
                    icon: None,
                    app_url: Some("https://dex.example".to_string()),
                },
                payload: "{}".to_string(),
            },
        };

        let raw = VersionedEnvelope::from_domain(&message).encode().unwrap();
        let decoded = VersionedEnvelope::decode(&raw)
            .unwrap()
            .to_domain("ignored")
            .unwrap();
        assert_eq!(decoded, message);
    }
}
