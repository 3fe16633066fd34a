//! Message controller — pending requests, side effects, versioned encoding
//!
//! Sits above the connection controller: every inbound request is recorded
//! in the pending table until a terminal response consumes it. Responses
//! for ids never recorded fail with `NoPendingRequest`. Outbound encoding
//! is negotiated per peer from the version observed on their traffic.
//!
//! The pending table has no expiry: a request the application never
//! answers stays recorded for the life of the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::connection::ConnectionController;
use crate::crypto::generic_hash;
use crate::message::{AppIdentity, Content, DomainMessage, VersionedEnvelope};
use crate::store::{SettingsStore, StoreError};
use crate::transport::{ConnectionMessage, TransportError};

#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("no pending request for message id {0}")]
    NoPendingRequest(String),
    #[error("no matching identity for peer {0}")]
    NoMatchingIdentity(String),
    #[error("protocol misuse: {0}")]
    Protocol(String),
    #[error("envelope error: {0}")]
    Envelope(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An inbound request awaiting exactly one correlated terminal response
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub message_id: String,
    /// Public key hex of the requesting peer
    pub origin: String,
    pub received_at: u64,
}

/// A decoded inbound message plus its transport-observed origin
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub origin: String,
    pub message: DomainMessage,
}

/// Peer-scoped identifier persisted when a permission is granted: the
/// response's public key bound to its network context.
pub fn derive_account_id(public_key: &str, network: &str) -> String {
    let mut preimage = Vec::with_capacity(public_key.len() + network.len() + 1);
    preimage.extend_from_slice(public_key.as_bytes());
    preimage.push(b':');
    preimage.extend_from_slice(network.as_bytes());
    bs58::encode(generic_hash(&preimage, 32)).into_string()
}

/// Bounded recently-seen window for replica deduplication
struct SeenWindow {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenWindow {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// True if the key was fresh
    fn insert(&mut self, key: String) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        if self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

pub struct MessageController {
    connection: ConnectionController,
    store: Arc<dyn SettingsStore>,
    /// Identity hash of this installation, stamped on outbound messages
    sender_id: String,
    pending: Mutex<HashMap<String, PendingRequest>>,
    peer_versions: RwLock<HashMap<String, String>>,
    app_identities: RwLock<HashMap<String, AppIdentity>>,
    seen: Mutex<SeenWindow>,
}

impl MessageController {
    pub fn new(
        connection: ConnectionController,
        store: Arc<dyn SettingsStore>,
        sender_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            store,
            sender_id,
            pending: Mutex::new(HashMap::new()),
            peer_versions: RwLock::new(HashMap::new()),
            app_identities: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenWindow::new(256)),
        })
    }

    /// Make a peer known for outbound version negotiation. The advertised
    /// version is refreshed from the peer's own traffic afterwards.
    pub fn register_peer(&self, public_key: &str, version: &str) {
        self.peer_versions
            .write()
            .insert(public_key.to_string(), version.to_string());
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.pending.lock().values().cloned().collect()
    }

    /// The app identity a peer declared on its permission request
    pub fn app_identity(&self, origin: &str) -> Option<AppIdentity> {
        self.app_identities.read().get(origin).cloned()
    }

    /// Merged, decoded, deduplicated inbound stream. Subscribe once; the
    /// pending table side effects run inside this pump.
    pub async fn subscribe(self: &Arc<Self>) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(64);
        let mut source = self.connection.subscribe().await;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = source.recv().await {
                if let Some(inbound) = controller.process_inbound(raw) {
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }

    fn process_inbound(&self, raw: ConnectionMessage) -> Option<InboundMessage> {
        let envelope = match VersionedEnvelope::decode(&raw.content) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(%error, origin = %raw.peer_id, "dropping undecodable envelope");
                return None;
            }
        };
        let message = match envelope.to_domain(&raw.peer_id) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, origin = %raw.peer_id, "dropping unmappable envelope");
                return None;
            }
        };

        // Replicated sends deliver the same logical message more than once
        let dedupe_key = format!("{}/{}", raw.peer_id, message.id);
        if !self.seen.lock().insert(dedupe_key) {
            trace!(id = %message.id, "duplicate replica dropped");
            return None;
        }

        self.peer_versions
            .write()
            .insert(raw.peer_id.clone(), message.version.clone());

        if message.content.is_request() {
            self.pending.lock().insert(
                message.id.clone(),
                PendingRequest {
                    message_id: message.id.clone(),
                    origin: raw.peer_id.clone(),
                    received_at: now_secs(),
                },
            );
            if let Content::PermissionRequest { app, .. } = &message.content {
                self.app_identities
                    .write()
                    .insert(raw.peer_id.clone(), app.clone());
            }
        }

        Some(InboundMessage {
            origin: raw.peer_id,
            message,
        })
    }

    /// Send a fresh request (or disconnect) to a peer
    pub async fn request(
        &self,
        destination: &str,
        content: Content,
    ) -> Result<DomainMessage, ControllerError> {
        if content.is_response() {
            return Err(ControllerError::Protocol(
                "responses must go through respond()".to_string(),
            ));
        }
        let version = self.version_for(destination)?;
        let message = DomainMessage::new(version, self.sender_id.clone(), content);
        self.dispatch(destination, &message).await?;
        Ok(message)
    }

    /// Answer a pending request. A terminal response consumes the pending
    /// entry; an acknowledge leaves it open. Granting a permission also
    /// persists the peer-scoped account identifier.
    pub async fn respond(
        &self,
        destination: &str,
        request_id: &str,
        content: Content,
    ) -> Result<DomainMessage, ControllerError> {
        if !content.is_response() {
            return Err(ControllerError::Protocol(
                "not a response kind".to_string(),
            ));
        }
        let version = self.version_for(destination)?;

        {
            let mut pending = self.pending.lock();
            if !pending.contains_key(request_id) {
                return Err(ControllerError::NoPendingRequest(request_id.to_string()));
            }
            if content.is_terminal() {
                pending.remove(request_id);
            }
        }

        if let Content::PermissionResponse {
            public_key,
            network,
            ..
        } = &content
        {
            let account_id = derive_account_id(public_key, network);
            let mut accounts = self.store.account_ids().await?;
            accounts.insert(destination.to_string(), account_id);
            self.store.set_account_ids(&accounts).await?;
        }

        let message = DomainMessage::response_to(
            request_id.to_string(),
            version,
            self.sender_id.clone(),
            content,
        );
        self.dispatch(destination, &message).await?;
        Ok(message)
    }

    fn version_for(&self, destination: &str) -> Result<String, ControllerError> {
        self.peer_versions
            .read()
            .get(destination)
            .cloned()
            .ok_or_else(|| ControllerError::NoMatchingIdentity(destination.to_string()))
    }

    async fn dispatch(
        &self,
        destination: &str,
        message: &DomainMessage,
    ) -> Result<(), ControllerError> {
        let raw = VersionedEnvelope::from_domain(message)
            .encode()
            .map_err(|e| ControllerError::Envelope(e.to_string()))?;
        self.connection
            .send(ConnectionMessage {
                peer_id: destination.to_string(),
                content: raw,
            })
            .await?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
