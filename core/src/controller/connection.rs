//! Connection controller — multiplexes the configured transports
//!
//! Inbound streams are merged into one: per-source order is preserved, no
//! ordering is guaranteed across sources. Outbound messages go to every
//! transport; a single failure surfaces as its concrete error, several
//! aggregate into `MultiTransportError`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::pairing::Peer;
use crate::transport::{fold_send_results, ConnectionMessage, Transport, TransportError};

pub struct ConnectionController {
    transports: Vec<Arc<dyn Transport>>,
}

impl ConnectionController {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// One merged stream over all transports' inbound messages
    pub async fn subscribe(&self) -> mpsc::Receiver<ConnectionMessage> {
        let (tx, rx) = mpsc::channel(64);
        for transport in &self.transports {
            let mut source = transport.subscribe().await;
            let tx = tx.clone();
            let kind = transport.transport_type();
            tokio::spawn(async move {
                while let Some(message) = source.recv().await {
                    if tx.send(message).await.is_err() {
                        debug!(transport = %kind, "merged subscriber gone, stopping fan-in");
                        break;
                    }
                }
            });
        }
        rx
    }

    /// Dispatch to every transport and fold the outcomes
    pub async fn send(&self, message: ConnectionMessage) -> Result<(), TransportError> {
        let mut results = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            results.push(transport.send(message.clone()).await);
        }
        fold_send_results(results)
    }

    /// Propagate a peer removal to every transport
    pub async fn remove_peer(&self, peer: &Peer) -> Result<(), TransportError> {
        let mut results = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            results.push(transport.remove_peer(peer).await);
        }
        fold_send_results(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::StubTransport;

    fn message(id: &str) -> ConnectionMessage {
        ConnectionMessage {
            peer_id: "peer".to_string(),
            content: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_merged_stream_preserves_per_source_order() {
        let first = StubTransport::new();
        let second = StubTransport::new();
        let controller =
            ConnectionController::new(vec![first.clone() as _, second.clone() as _]);

        let mut merged = controller.subscribe().await;
        first.inject(message("a1")).await;
        first.inject(message("a2")).await;
        second.inject(message("b1")).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(merged.recv().await.unwrap().content);
        }

        // Per-source order holds regardless of interleaving
        let firsts: Vec<_> = seen.iter().filter(|c| c.starts_with('a')).collect();
        assert_eq!(firsts, vec!["a1", "a2"]);
        assert!(seen.contains(&"b1".to_string()));
    }

    #[tokio::test]
    async fn test_send_reaches_all_transports() {
        let first = StubTransport::new();
        let second = StubTransport::new();
        let controller =
            ConnectionController::new(vec![first.clone() as _, second.clone() as _]);

        controller.send(message("x")).await.unwrap();
        assert_eq!(first.sent.lock().len(), 1);
        assert_eq!(second.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_single_failure_unwraps() {
        let ok = StubTransport::new();
        let bad = StubTransport::failing();
        let controller = ConnectionController::new(vec![ok as _, bad as _]);

        let result = controller.send(message("x")).await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_multiple_failures_aggregate() {
        let controller = ConnectionController::new(vec![
            StubTransport::failing() as _,
            StubTransport::failing() as _,
        ]);

        let result = controller.send(message("x")).await;
        match result {
            Err(TransportError::Multi(multi)) => assert_eq!(multi.errors.len(), 2),
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }
}
