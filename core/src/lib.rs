// Peerlink Core — end-to-end encrypted messaging over untrusted relays
//
// "Can two parties that never connected directly find the same relay
//  and read each other's messages, while the relay reads nothing?"
//
// If a change doesn't serve that question, it doesn't belong here.

pub mod codec;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod http;
pub mod message;
pub mod pairing;
pub mod relay;
pub mod store;
pub mod transport;

pub use config::{Config, Context, DEFAULT_RELAY_NODES, PROTOCOL_VERSION};
pub use controller::{
    ConnectionController, ControllerError, InboundMessage, MessageController, PendingRequest,
};
pub use crypto::{CryptoError, IdentityKeyPair, Role, SessionKeyPair};
pub use http::{HttpClient, HttpError};
pub use message::{AppIdentity, Content, DomainMessage, VersionedEnvelope};
pub use pairing::{PairingCoordinator, PairingError, PairingPayload, Peer};
pub use relay::{
    RelayEvent, RelayNodeSelector, RelayRoom, RelaySyncEngine, SelectorError, SyncError,
};
pub use store::{BackendSettingsStore, SettingsStore, StoreError};
pub use transport::{
    ConnectionMessage, MultiTransportError, Transport, TransportError, TransportType,
};

#[cfg(not(target_arch = "wasm32"))]
pub use http::UreqClient;

/// Initialize tracing (idempotent). Applications embedding the crate can
/// install their own subscriber instead.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
