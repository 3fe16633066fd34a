//! Pairing coordinator — the relay-backed transport
//!
//! Maps logical peers to relay rooms: derives per-peer session keys, runs
//! the pairing handshake, filters and decrypts inbound relay events, and
//! fans outbound messages across the recipient's replicated relay slots.
//! Decode/decrypt failures on the inbound stream are logged and dropped,
//! never surfaced — the relay channel carries noise from unrelated traffic.

pub mod payload;

pub use payload::{PairingPayload, Peer};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::crypto::{
    self, looks_like_ciphertext, open_sealed, seal, CryptoError, IdentityKeyPair, Role,
    SessionKeyPair,
};
use crate::http::HttpClient;
use crate::relay::selector::{recipient_nodes, RelayNodeSelector, SelectorError};
use crate::relay::sync::{LoginCredentials, RelayEvent, RelaySyncEngine, RoomState, SyncError};
use crate::relay::{select_node, RelayRoom};
use crate::store::{SettingsStore, StoreError};
use crate::transport::{ConnectionMessage, Transport, TransportError, TransportType};

#[derive(Debug, Clone, Error)]
pub enum PairingError {
    #[error("malformed pairing payload: {0}")]
    Payload(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sticky room binding for one (peer, node) slot
#[derive(Debug, Clone)]
struct RoomAssignment {
    room_id: String,
    /// A vacated room goes inactive, it is never deleted
    active: bool,
}

pub struct PairingCoordinator {
    identity: IdentityKeyPair,
    config: Config,
    store: Arc<dyn SettingsStore>,
    engine: Arc<RelaySyncEngine>,
    peers: RwLock<HashMap<String, Peer>>,
    session_keys: RwLock<HashMap<String, SessionKeyPair>>,
    room_assignments: RwLock<HashMap<(String, String), RoomAssignment>>,
    subscribers: RwLock<Vec<mpsc::Sender<ConnectionMessage>>>,
    pump_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PairingCoordinator {
    /// Resolve the home relay, authenticate, and start pumping events.
    pub async fn start(
        identity: IdentityKeyPair,
        config: Config,
        store: Arc<dyn SettingsStore>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Arc<Self>, PairingError> {
        let selector = RelayNodeSelector::new(Arc::clone(&http), Arc::clone(&store));
        let home_relay = selector
            .resolve_home_relay(&identity.identity_hash(), &config.relay_candidates)
            .await?;

        let engine = Arc::new(RelaySyncEngine::new(
            home_relay,
            http,
            Arc::clone(&store),
            config.sync.clone(),
        ));
        engine.start(relay_credentials(&identity)).await?;

        let peers: HashMap<String, Peer> = store
            .peers()
            .await?
            .into_iter()
            .map(|peer| (peer.public_key.clone(), peer))
            .collect();

        let coordinator = Arc::new(Self {
            identity,
            config,
            store,
            engine,
            peers: RwLock::new(peers),
            session_keys: RwLock::new(HashMap::new()),
            room_assignments: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            pump_task: Mutex::new(None),
        });
        coordinator.spawn_event_pump();
        Ok(coordinator)
    }

    pub fn home_relay(&self) -> &str {
        self.engine.node()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer(&self, public_key: &str) -> Result<Peer, PairingError> {
        self.peers
            .read()
            .get(public_key)
            .cloned()
            .ok_or_else(|| PairingError::UnknownPeer(public_key.to_string()))
    }

    /// Halt the poll and pump scopes. Merged state stays valid.
    pub fn stop(&self) {
        self.engine.stop_polling();
        if let Some(handle) = self.pump_task.lock().take() {
            handle.abort();
        }
    }

    /// The payload this party hands out over QR/deeplink
    pub fn build_pairing_payload(&self) -> PairingPayload {
        PairingPayload {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.config.app_name.clone(),
            version: self.config.version.clone(),
            public_key: self.identity.public_key_hex(),
            relay_server: self.engine.node().to_string(),
            icon: self.config.app_icon.clone(),
            app_url: self.config.app_url.clone(),
        }
    }

    /// Parse an out-of-band payload into an unpaired peer
    pub fn parse_pairing_payload(raw: &str) -> Result<Peer, PairingError> {
        Ok(Peer::from_payload(PairingPayload::from_base58(raw)?))
    }

    /// Per-peer session keys: sent traffic uses the initiator-role half,
    /// received traffic the responder-role half, so both sides derive
    /// complementary keys from key material alone — no handshake state to
    /// persist. Cached per peer public key for the process lifetime.
    fn session_keys_for(&self, peer: &Peer) -> Result<SessionKeyPair, PairingError> {
        if let Some(keys) = self.session_keys.read().get(&peer.public_key) {
            return Ok(keys.clone());
        }

        let peer_pk = peer.public_key_bytes()?;
        let outbound = crypto::derive_session_key_pair(
            Role::Initiator,
            self.identity.signing_key(),
            &peer_pk,
        )?;
        let inbound = crypto::derive_session_key_pair(
            Role::Responder,
            self.identity.signing_key(),
            &peer_pk,
        )?;
        let keys = SessionKeyPair {
            send: outbound.send,
            receive: inbound.receive,
        };
        self.session_keys
            .write()
            .insert(peer.public_key.clone(), keys.clone());
        Ok(keys)
    }

    /// Respond to a pairing request: derive session keys, open a
    /// two-member room, and send our own payload back, sealed to the
    /// initiator's key.
    pub async fn pair(&self, mut peer: Peer) -> Result<(), PairingError> {
        let peer_pk = peer.public_key_bytes()?;
        self.session_keys_for(&peer)?;

        self.correct_relay_server(&mut peer)?;

        let address = peer.address_hash_hex()?;
        let node = peer.relay_server.clone();
        let recipient = relay_user(&address, &node);
        let room_id = self.ensure_room(&peer.public_key, &node, &recipient).await?;

        let response = self.build_pairing_payload();
        let sealed = seal(
            &peer_pk,
            codec_to_string(&response)?.as_bytes(),
        )?;
        self.engine.send_text(&room_id, &sealed).await?;

        peer.is_paired = true;
        self.upsert_peer(peer.clone());
        self.persist_peers().await?;
        info!(peer = %peer.name, "pairing complete");
        Ok(())
    }

    /// The peer's advertised node is corrected post-hoc when it differs
    /// from the deterministically recomputed one.
    fn correct_relay_server(&self, peer: &mut Peer) -> Result<(), PairingError> {
        let address = peer.address_hash()?;
        if let Some(expected) = select_node(&self.config.relay_candidates, &address, &[0]) {
            if peer.relay_server != expected {
                debug!(
                    advertised = %peer.relay_server,
                    computed = %expected,
                    "correcting peer relay server"
                );
                peer.relay_server = expected.to_string();
            }
        }
        Ok(())
    }

    /// Registration of the responder once its sealed pairing response
    /// arrives on the initiator side.
    async fn accept_pairing_response(&self, payload: PairingPayload) -> Result<(), PairingError> {
        let mut peer = Peer::from_payload(payload);
        self.session_keys_for(&peer)?;

        self.correct_relay_server(&mut peer)?;
        peer.is_paired = true;
        self.upsert_peer(peer.clone());
        self.persist_peers().await?;
        info!(peer = %peer.name, "peer paired via relay response");
        Ok(())
    }

    fn upsert_peer(&self, peer: Peer) {
        self.peers.write().insert(peer.public_key.clone(), peer);
    }

    async fn persist_peers(&self) -> Result<(), StoreError> {
        let peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        self.store.set_peers(&peers).await
    }

    /// Sticky room for a (peer, node) slot. A room left behind is marked
    /// inactive and superseded, not deleted.
    async fn ensure_room(
        &self,
        peer_pk: &str,
        node: &str,
        recipient: &str,
    ) -> Result<String, PairingError> {
        let key = (peer_pk.to_string(), node.to_string());

        let reusable = {
            let assignments = self.room_assignments.read();
            assignments.get(&key).and_then(|assignment| {
                if !assignment.active {
                    return None;
                }
                match self.engine.room(&assignment.room_id) {
                    Some(RelayRoom {
                        state: RoomState::Left,
                        ..
                    }) => None,
                    _ => Some(assignment.room_id.clone()),
                }
            })
        };
        if let Some(room_id) = reusable {
            return Ok(room_id);
        }

        // Deactivate a stale binding before superseding it
        if let Some(assignment) = self.room_assignments.write().get_mut(&key) {
            assignment.active = false;
        }

        let room_id = self.engine.create_room(&[recipient.to_string()]).await?;
        self.room_assignments.write().insert(
            key,
            RoomAssignment {
                room_id: room_id.clone(),
                active: true,
            },
        );
        Ok(room_id)
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let (initial, mut live) = coordinator.engine.subscribe();
        let handle = tokio::spawn(async move {
            for event in initial {
                coordinator.handle_event(event).await;
            }
            loop {
                match live.recv().await {
                    Ok(event) => coordinator.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump_task.lock() = Some(handle);
    }

    async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Invite { room_id, sender } => {
                trace!(room = %room_id, from = %sender, "room invite");
                if let Err(error) = self.engine.join(&room_id).await {
                    warn!(%error, room = %room_id, "failed to join invited room");
                }
            }
            RelayEvent::TextMessage {
                room_id,
                sender,
                body,
            } => {
                self.handle_text_event(&room_id, &sender, &body).await;
            }
            RelayEvent::Create { .. } | RelayEvent::Join { .. } => {}
        }
    }

    async fn handle_text_event(&self, room_id: &str, sender: &str, body: &str) {
        // Our own replicated sends come back through sync too
        if sender_matches(sender, &self.identity.identity_hash_hex()) {
            return;
        }
        if !looks_like_ciphertext(body) {
            trace!(room = %room_id, "dropping non-ciphertext event");
            return;
        }

        let matched = self.match_sender(sender);
        match matched {
            Some(peer) => {
                let keys = match self.session_keys_for(&peer) {
                    Ok(keys) => keys,
                    Err(error) => {
                        debug!(%error, peer = %peer.name, "cannot derive session keys, dropping event");
                        return;
                    }
                };
                match crypto::decrypt(body, &keys.receive) {
                    Ok(plaintext) => {
                        let Ok(content) = String::from_utf8(plaintext) else {
                            debug!(room = %room_id, "decrypted payload is not UTF-8, dropping");
                            return;
                        };
                        self.record_inbound_room(&peer, sender, room_id);
                        self.deliver(ConnectionMessage {
                            peer_id: peer.public_key.clone(),
                            content,
                        })
                        .await;
                    }
                    Err(error) => {
                        // Expected on foreign traffic sharing the room
                        debug!(%error, room = %room_id, "dropping undecryptable event");
                    }
                }
            }
            None => {
                // Unknown sender: this may be the sealed pairing response
                match open_sealed(self.identity.signing_key(), body) {
                    Ok(plaintext) => {
                        let parsed = String::from_utf8(plaintext)
                            .ok()
                            .and_then(|text| crate::codec::from_json::<PairingPayload>(&text).ok());
                        match parsed {
                            Some(payload) => {
                                if let Err(error) = self.accept_pairing_response(payload).await {
                                    warn!(%error, "failed to accept pairing response");
                                }
                            }
                            None => debug!(room = %room_id, "sealed payload is not a pairing response"),
                        }
                    }
                    Err(_) => {
                        trace!(room = %room_id, from = %sender, "dropping event from unknown sender");
                    }
                }
            }
        }
    }

    /// Verify the sender address against known peers before attempting
    /// decryption.
    fn match_sender(&self, sender: &str) -> Option<Peer> {
        let peers = self.peers.read();
        peers
            .values()
            .find(|peer| {
                if peer.is_removed {
                    return false;
                }
                peer.address_hash_hex()
                    .map(|hash| sender_matches(sender, &hash))
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Inbound traffic pins the sticky room for that peer slot
    fn record_inbound_room(&self, peer: &Peer, sender: &str, room_id: &str) {
        let Some(node) = node_of(sender) else {
            return;
        };
        let key = (peer.public_key.clone(), node.to_string());
        let mut assignments = self.room_assignments.write();
        match assignments.get(&key) {
            Some(assignment) if assignment.active && assignment.room_id == room_id => {}
            _ => {
                assignments.insert(
                    key,
                    RoomAssignment {
                        room_id: room_id.to_string(),
                        active: true,
                    },
                );
            }
        }
    }

    async fn deliver(&self, message: ConnectionMessage) {
        let subscribers: Vec<mpsc::Sender<ConnectionMessage>> =
            self.subscribers.read().clone();
        let mut any_closed = false;
        for subscriber in &subscribers {
            if subscriber.send(message.clone()).await.is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            self.subscribers
                .write()
                .retain(|subscriber| !subscriber.is_closed());
        }
    }
}

#[async_trait]
impl Transport for PairingCoordinator {
    fn transport_type(&self) -> TransportType {
        TransportType::P2p
    }

    async fn subscribe(&self) -> mpsc::Receiver<ConnectionMessage> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.write().push(tx);
        rx
    }

    /// Encrypt for the destination peer and fan out across its replicated
    /// relay slots. One successful slot is a successful send; ordering
    /// across slots is not guaranteed and duplicates are possible.
    async fn send(&self, message: ConnectionMessage) -> Result<(), TransportError> {
        let peer = self
            .peers
            .read()
            .get(&message.peer_id)
            .filter(|peer| !peer.is_removed)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(message.peer_id.clone()))?;

        let keys = self
            .session_keys_for(&peer)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let address = peer
            .address_hash()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let address_hex = hex::encode(address);
        let ciphertext = crypto::encrypt(message.content.as_bytes(), &keys.send)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let nodes = recipient_nodes(
            &self.config.relay_candidates,
            &address,
            self.config.replication_count,
        );
        if nodes.is_empty() {
            return Err(TransportError::SendFailed(
                "no relay candidates configured".to_string(),
            ));
        }

        let mut delivered = 0usize;
        let mut last_error = None;
        for node in nodes {
            let recipient = relay_user(&address_hex, &node);
            let attempt = async {
                let room_id = self
                    .ensure_room(&peer.public_key, &node, &recipient)
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                self.engine
                    .send_text(&room_id, &ciphertext)
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                Ok::<(), TransportError>(())
            };
            match attempt.await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(%error, node = %node, "replica send failed");
                    last_error = Some(error);
                }
            }
        }

        if delivered == 0 {
            Err(last_error
                .unwrap_or_else(|| TransportError::SendFailed("no replicas attempted".to_string())))
        } else {
            Ok(())
        }
    }

    /// Complete the tombstone transition: unsubscribe the peer's session
    /// and persist the removal.
    async fn remove_peer(&self, peer: &Peer) -> Result<(), TransportError> {
        {
            let mut peers = self.peers.write();
            if let Some(known) = peers.get_mut(&peer.public_key) {
                known.is_removed = true;
            }
        }
        self.session_keys.write().remove(&peer.public_key);
        {
            let mut assignments = self.room_assignments.write();
            for ((peer_pk, _), assignment) in assignments.iter_mut() {
                if peer_pk == &peer.public_key {
                    assignment.active = false;
                }
            }
        }
        self.persist_peers()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        info!(peer = %peer.name, "peer removed");
        Ok(())
    }
}

/// Deterministic relay credentials: either side can re-authenticate from
/// identity key material alone, with no prior coordination.
pub fn relay_credentials(identity: &IdentityKeyPair) -> LoginCredentials {
    let user = identity.identity_hash_hex();
    let signature = identity.sign(format!("login:{user}").as_bytes());
    LoginCredentials {
        password: format!(
            "ed:{}:{}",
            hex::encode(signature),
            identity.public_key_hex()
        ),
        device_id: identity.public_key_hex(),
        user,
    }
}

/// Relay user id for an identity hash on a node
pub fn relay_user(address_hash_hex: &str, node: &str) -> String {
    format!("@{address_hash_hex}:{node}")
}

fn sender_matches(sender: &str, address_hash_hex: &str) -> bool {
    sender
        .strip_prefix('@')
        .and_then(|rest| rest.split(':').next())
        .map(|hash| hash == address_hash_hex)
        .unwrap_or(false)
}

fn node_of(sender: &str) -> Option<&str> {
    sender.split_once(':').map(|(_, node)| node)
}

fn codec_to_string(payload: &PairingPayload) -> Result<String, PairingError> {
    crate::codec::to_json(payload).map_err(|e| PairingError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_user_format() {
        assert_eq!(
            relay_user("abc123", "sync-1.peerlink.network"),
            "@abc123:sync-1.peerlink.network"
        );
    }

    #[test]
    fn test_sender_matching() {
        assert!(sender_matches("@abc123:n1", "abc123"));
        assert!(!sender_matches("@abc124:n1", "abc123"));
        assert!(!sender_matches("abc123:n1", "abc123"));
        assert!(!sender_matches("@abc1234:n1", "abc123"));
    }

    #[test]
    fn test_node_extraction() {
        assert_eq!(node_of("@abc:n1"), Some("n1"));
        assert_eq!(node_of("@abc"), None);
    }

    #[test]
    fn test_credentials_are_deterministic_and_verifiable() {
        let identity = IdentityKeyPair::from_seed("wallet-seed");
        let first = relay_credentials(&identity);
        let second = relay_credentials(&identity);

        assert_eq!(first.user, second.user);
        assert_eq!(first.password, second.password);
        assert_eq!(first.device_id, identity.public_key_hex());

        // The password embeds a signature the relay can check
        let parts: Vec<&str> = first.password.splitn(3, ':').collect();
        assert_eq!(parts[0], "ed");
        let signature = hex::decode(parts[1]).unwrap();
        let public_key = hex::decode(parts[2]).unwrap();
        assert!(IdentityKeyPair::verify(
            format!("login:{}", first.user).as_bytes(),
            &signature,
            &public_key,
        )
        .unwrap());
    }
}
