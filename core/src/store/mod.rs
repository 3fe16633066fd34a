// Store module — the persistent key-value boundary of the core
//
// The core treats "no value" as a valid empty/initial state, never an error.

pub mod backend;

pub use backend::{MemoryStorage, StorageBackend};

#[cfg(not(target_arch = "wasm32"))]
pub use backend::SledStorage;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec;
use crate::pairing::Peer;
use crate::relay::RelayRoom;

/// Storage error — generic I/O failure at the key-value boundary
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(String),
    #[error("corrupt stored value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// The typed settings the core persists between restarts
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn seed(&self) -> Result<Option<String>, StoreError>;
    async fn set_seed(&self, seed: &str) -> Result<(), StoreError>;

    async fn peers(&self) -> Result<Vec<Peer>, StoreError>;
    async fn set_peers(&self, peers: &[Peer]) -> Result<(), StoreError>;

    async fn relay_server(&self) -> Result<Option<String>, StoreError>;
    async fn set_relay_server(&self, node: &str) -> Result<(), StoreError>;

    async fn sync_token(&self) -> Result<Option<String>, StoreError>;
    async fn set_sync_token(&self, token: &str) -> Result<(), StoreError>;

    async fn rooms(&self) -> Result<Vec<RelayRoom>, StoreError>;
    async fn set_rooms(&self, rooms: &[RelayRoom]) -> Result<(), StoreError>;

    async fn completed_migrations(&self) -> Result<Vec<String>, StoreError>;
    async fn set_completed_migrations(&self, migrations: &[String]) -> Result<(), StoreError>;

    async fn account_ids(&self) -> Result<HashMap<String, String>, StoreError>;
    async fn set_account_ids(&self, accounts: &HashMap<String, String>) -> Result<(), StoreError>;
}

const SEED_KEY: &[u8] = b"settings_seed";
const PEERS_KEY: &[u8] = b"settings_peers";
const RELAY_SERVER_KEY: &[u8] = b"settings_relay_server";
const SYNC_TOKEN_KEY: &[u8] = b"settings_sync_token";
const ROOMS_KEY: &[u8] = b"settings_rooms";
const MIGRATIONS_KEY: &[u8] = b"settings_completed_migrations";
const ACCOUNT_IDS_KEY: &[u8] = b"settings_account_ids";

/// Settings store over a pluggable storage backend
#[derive(Clone)]
pub struct BackendSettingsStore {
    backend: Arc<dyn StorageBackend>,
}

impl BackendSettingsStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// In-memory store, nothing survives the process
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Persistent store backed by sled at the given path
    #[cfg(not(target_arch = "wasm32"))]
    pub fn persistent(path: &str) -> Result<Self, StoreError> {
        let backend = backend::SledStorage::new(path).map_err(StoreError::Io)?;
        Ok(Self::new(Arc::new(backend)))
    }

    fn get_string(&self, key: &[u8]) -> Result<Option<String>, StoreError> {
        let raw = self.backend.get(key).map_err(StoreError::Io)?;
        match raw {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| StoreError::Corrupt {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: e.to_string(),
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn put_string(&self, key: &[u8], value: &str) -> Result<(), StoreError> {
        self.backend
            .put(key, value.as_bytes())
            .map_err(StoreError::Io)?;
        self.backend.flush().map_err(StoreError::Io)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get_string(key)? {
            Some(raw) => {
                let value = codec::from_json(&raw).map_err(|e| StoreError::Corrupt {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(&self, key: &[u8], value: &T) -> Result<(), StoreError> {
        let raw = codec::to_json(value).map_err(|e| StoreError::Io(e.to_string()))?;
        self.put_string(key, &raw)
    }
}

#[async_trait]
impl SettingsStore for BackendSettingsStore {
    async fn seed(&self) -> Result<Option<String>, StoreError> {
        self.get_string(SEED_KEY)
    }

    async fn set_seed(&self, seed: &str) -> Result<(), StoreError> {
        self.put_string(SEED_KEY, seed)
    }

    async fn peers(&self) -> Result<Vec<Peer>, StoreError> {
        Ok(self.get_json(PEERS_KEY)?.unwrap_or_default())
    }

    async fn set_peers(&self, peers: &[Peer]) -> Result<(), StoreError> {
        self.put_json(PEERS_KEY, &peers)
    }

    async fn relay_server(&self) -> Result<Option<String>, StoreError> {
        self.get_string(RELAY_SERVER_KEY)
    }

    async fn set_relay_server(&self, node: &str) -> Result<(), StoreError> {
        self.put_string(RELAY_SERVER_KEY, node)
    }

    async fn sync_token(&self) -> Result<Option<String>, StoreError> {
        self.get_string(SYNC_TOKEN_KEY)
    }

    async fn set_sync_token(&self, token: &str) -> Result<(), StoreError> {
        self.put_string(SYNC_TOKEN_KEY, token)
    }

    async fn rooms(&self) -> Result<Vec<RelayRoom>, StoreError> {
        Ok(self.get_json(ROOMS_KEY)?.unwrap_or_default())
    }

    async fn set_rooms(&self, rooms: &[RelayRoom]) -> Result<(), StoreError> {
        self.put_json(ROOMS_KEY, &rooms)
    }

    async fn completed_migrations(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.get_json(MIGRATIONS_KEY)?.unwrap_or_default())
    }

    async fn set_completed_migrations(&self, migrations: &[String]) -> Result<(), StoreError> {
        self.put_json(MIGRATIONS_KEY, &migrations)
    }

    async fn account_ids(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.get_json(ACCOUNT_IDS_KEY)?.unwrap_or_default())
    }

    async fn set_account_ids(&self, accounts: &HashMap<String, String>) -> Result<(), StoreError> {
        self.put_json(ACCOUNT_IDS_KEY, accounts)
    }
}
