// Domain message types — what the application exchanges with a paired peer
//
// Blockchain-specific request/response bodies stay opaque strings; the core
// only distinguishes enough structure to track pending requests and run
// permission side effects.

use serde::{Deserialize, Serialize};

/// Self-declared identity of the requesting application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

/// Message content, by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// First request of a pairing: asks the remote side to grant access
    PermissionRequest { app: AppIdentity, payload: String },
    /// Any other request (operation, signing, ...) — body is opaque here
    Request { payload: String },
    /// Grants a permission request; carries the granting account's key and
    /// network context
    PermissionResponse {
        public_key: String,
        network: String,
        payload: String,
    },
    /// Response to a plain request
    Response { payload: String },
    /// Non-terminal "got it, still working" response
    Acknowledge,
    /// Terminal error response
    Error { description: String },
    /// The peer is going away; no response expected
    Disconnect,
}

impl Content {
    /// True for message kinds that open a pending request
    pub fn is_request(&self) -> bool {
        matches!(self, Content::PermissionRequest { .. } | Content::Request { .. })
    }

    /// True for message kinds that answer a pending request
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Content::PermissionResponse { .. }
                | Content::Response { .. }
                | Content::Acknowledge
                | Content::Error { .. }
        )
    }

    /// A terminal response consumes the pending entry; an acknowledge
    /// leaves it open for the real answer.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Content::Acknowledge)
    }
}

/// The unit the application sends and receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMessage {
    /// Correlates a response to its request
    pub id: String,
    /// The wire version this message was (or will be) encoded with
    pub version: String,
    /// Identity hash of the sending party
    pub sender_id: String,
    pub content: Content,
}

impl DomainMessage {
    pub fn new(version: String, sender_id: String, content: Content) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version,
            sender_id,
            content,
        }
    }

    /// A response correlated to an existing request id
    pub fn response_to(
        request_id: String,
        version: String,
        sender_id: String,
        content: Content,
    ) -> Self {
        Self {
            id: request_id,
            version,
            sender_id,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response_classification() {
        let request = Content::Request {
            payload: "{\"op\":\"transfer\"}".to_string(),
        };
        assert!(request.is_request());
        assert!(!request.is_response());

        let response = Content::Response {
            payload: "{\"ok\":true}".to_string(),
        };
        assert!(response.is_response());
        assert!(response.is_terminal());

        assert!(Content::Acknowledge.is_response());
        assert!(!Content::Acknowledge.is_terminal());
    }

    #[test]
    fn test_new_message_gets_unique_id() {
        let a = DomainMessage::new("3".into(), "sender".into(), Content::Acknowledge);
        let b = DomainMessage::new("3".into(), "sender".into(), Content::Acknowledge);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_content_wire_tags() {
        let encoded = serde_json::to_string(&Content::Acknowledge).unwrap();
        assert!(encoded.contains("\"acknowledge\""));

        let decoded: Content =
            serde_json::from_str("{\"type\":\"request\",\"payload\":\"x\"}").unwrap();
        assert_eq!(
            decoded,
            Content::Request {
                payload: "x".to_string()
            }
        );
    }
}
