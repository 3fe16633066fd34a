//! Transport abstraction layer
//!
//! A `Transport` is any channel that can carry `ConnectionMessage`s to and
//! from paired peers. The controller treats all transports uniformly: one
//! merged inbound stream, sends dispatched to every configured transport.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pairing::Peer;

/// Transport variants known to this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Relay-backed peer-to-peer channel
    P2p,
    /// In-process loopback for tests
    Local,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::P2p => write!(f, "P2p"),
            TransportType::Local => write!(f, "Local"),
        }
    }
}

/// The unit exchanged across the controller/transport boundary.
/// Inbound, `peer_id` is the origin; outbound, the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMessage {
    /// Public key hex of the remote party
    pub peer_id: String,
    /// Serialized versioned envelope (outbound) or decrypted payload
    /// (inbound)
    pub content: String,
}

/// Errors from a single transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport not started")]
    NotStarted,
    #[error(transparent)]
    Multi(#[from] MultiTransportError),
}

/// Aggregate of several transport failures for one logical send.
/// A single failure is unwrapped to its concrete variant instead.
#[derive(Debug, Clone, Error)]
#[error("{} transports failed", .errors.len())]
pub struct MultiTransportError {
    pub errors: Vec<TransportError>,
}

/// Fold per-transport send results into one outcome
pub fn fold_send_results(results: Vec<Result<(), TransportError>>) -> Result<(), TransportError> {
    let mut errors: Vec<TransportError> = results.into_iter().filter_map(Result::err).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(TransportError::Multi(MultiTransportError { errors })),
    }
}

/// Capability interface over a message channel to paired peers
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Inbound messages, in per-transport arrival order
    async fn subscribe(&self) -> mpsc::Receiver<ConnectionMessage>;

    /// Deliver one message to its destination peer
    async fn send(&self, message: ConnectionMessage) -> Result<(), TransportError>;

    /// Propagated peer removal: unsubscribe and persist the tombstone
    async fn remove_peer(&self, peer: &Peer) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_all_ok() {
        assert!(fold_send_results(vec![Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn test_fold_single_error_unwraps() {
        let result = fold_send_results(vec![
            Ok(()),
            Err(TransportError::SendFailed("boom".to_string())),
        ]);
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }

    #[test]
    fn test_fold_multiple_errors_aggregate() {
        let result = fold_send_results(vec![
            Err(TransportError::SendFailed("a".to_string())),
            Err(TransportError::PeerNotFound("b".to_string())),
        ]);
        match result {
            Err(TransportError::Multi(multi)) => assert_eq!(multi.errors.len(), 2),
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::P2p.to_string(), "P2p");
        assert_eq!(TransportType::Local.to_string(), "Local");
    }
}
