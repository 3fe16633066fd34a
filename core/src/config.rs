// Configuration and the explicit dependency graph
//
// No ambient globals: everything a component needs travels in a `Context`
// constructed once at startup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::IdentityKeyPair;
use crate::http::HttpClient;
use crate::relay::sync::RelaySyncConfig;
use crate::store::{SettingsStore, StoreError};

/// Wire protocol version this build speaks by default
pub const PROTOCOL_VERSION: &str = "3";

/// Stock relay candidate set
pub const DEFAULT_RELAY_NODES: [&str; 3] = [
    "sync-1.peerlink.network",
    "sync-2.peerlink.network",
    "sync-3.peerlink.network",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Self-declared application name, shown to the remote party
    pub app_name: String,
    pub app_icon: Option<String>,
    pub app_url: Option<String>,

    /// Protocol version advertised in pairing payloads
    pub version: String,

    /// Relay nodes eligible for selection
    pub relay_candidates: Vec<String>,

    /// How many relay slots a single logical message fans out to
    pub replication_count: u8,

    /// Sync engine settings
    pub sync: RelaySyncConfig,
}

impl Config {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            app_icon: None,
            app_url: None,
            version: PROTOCOL_VERSION.to_string(),
            relay_candidates: DEFAULT_RELAY_NODES
                .iter()
                .map(|node| node.to_string())
                .collect(),
            replication_count: 1,
            sync: RelaySyncConfig::default(),
        }
    }
}

/// Identity, configuration, and the external collaborators, assembled once
/// and passed by reference
pub struct Context {
    pub identity: IdentityKeyPair,
    pub config: Config,
    pub store: Arc<dyn SettingsStore>,
    pub http: Arc<dyn HttpClient>,
}

impl Context {
    /// Load the persisted seed (creating one on first run) and derive the
    /// installation identity from it.
    pub async fn init(
        config: Config,
        store: Arc<dyn SettingsStore>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, StoreError> {
        let seed = match store.seed().await? {
            Some(seed) => seed,
            None => {
                let seed = uuid::Uuid::new_v4().to_string();
                store.set_seed(&seed).await?;
                tracing::info!("generated new identity seed");
                seed
            }
        };
        let identity = IdentityKeyPair::from_seed(&seed);

        Ok(Self {
            identity,
            config,
            store,
            http,
        })
    }
}
