//! Relay sync engine — one authenticated session against one relay node
//!
//! All mutable session state lives in a single `SyncState`, changed only by
//! the pure `reduce` function under one lock. The poll loop logs in once,
//! then repeatedly calls `/sync` with the last token; at most one sync
//! request is in flight per engine — concurrent callers share the in-flight
//! result instead of issuing duplicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::api::{
    self, auth_headers, CreateRoomRequest, CreateRoomResponse, InviteRequest, LoginRequest,
    LoginResponse, SendRequest, SendResponse, SyncResponse,
};
use super::base_url;
use crate::codec;
use crate::http::{HttpClient, HttpError};
use crate::store::{SettingsStore, StoreError};

/// Membership state of a relay room, from this session's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    Joined,
    Invited,
    Left,
    Unknown,
}

/// A relay-side room. Member lists only ever grow — sync deltas are merged
/// by union, never replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRoom {
    pub id: String,
    pub state: RoomState,
    pub members: Vec<String>,
}

impl RelayRoom {
    pub fn new(id: String, state: RoomState) -> Self {
        Self {
            id,
            state,
            members: Vec::new(),
        }
    }

    pub fn add_member(&mut self, user_id: &str) {
        if !self.members.iter().any(|member| member == user_id) {
            self.members.push(user_id.to_string());
        }
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|member| member == user_id)
    }
}

/// Ephemeral relay event, replayed to subscribers in relay order within a
/// room. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Create { creator: String },
    Invite { room_id: String, sender: String },
    Join { room_id: String, user_id: String },
    TextMessage {
        room_id: String,
        sender: String,
        body: String,
    },
}

/// The single mutable state of one relay session
#[derive(Debug, Clone)]
pub struct SyncState {
    pub is_polling: bool,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub access_token: Option<String>,
    pub sync_token: Option<String>,
    pub polling_timeout_ms: u64,
    pub polling_retries: u32,
    pub max_retries: u32,
    pub transaction_counter: u64,
    pub rooms: HashMap<String, RelayRoom>,
}

impl SyncState {
    pub fn new(max_retries: u32, polling_timeout_ms: u64) -> Self {
        Self {
            is_polling: false,
            user_id: None,
            device_id: None,
            access_token: None,
            sync_token: None,
            polling_timeout_ms,
            polling_retries: 0,
            max_retries,
            transaction_counter: 0,
            rooms: HashMap::new(),
        }
    }
}

/// State transitions. Applied one at a time under the engine's lock, so
/// concurrent callers always observe a consistent state.
#[derive(Debug, Clone)]
pub enum SyncAction {
    Init {
        user_id: String,
        device_id: String,
        access_token: String,
    },
    SyncSucceeded {
        token: Option<String>,
        timeout_ms: Option<u64>,
        rooms: Vec<RelayRoom>,
    },
    SyncFailed,
    TxnCreated,
    /// Stop polling, keep the session and its merged state
    Reset,
    /// Back to a blank session
    HardReset,
}

/// Pure reducer over the session state
pub fn reduce(state: SyncState, action: SyncAction) -> SyncState {
    let mut next = state;
    match action {
        SyncAction::Init {
            user_id,
            device_id,
            access_token,
        } => {
            next.user_id = Some(user_id);
            next.device_id = Some(device_id);
            next.access_token = Some(access_token);
            next.is_polling = true;
            next.polling_retries = 0;
        }
        SyncAction::SyncSucceeded {
            token,
            timeout_ms,
            rooms,
        } => {
            next.polling_retries = 0;
            if token.is_some() {
                next.sync_token = token;
            }
            if let Some(timeout_ms) = timeout_ms {
                next.polling_timeout_ms = timeout_ms;
            }
            merge_rooms(&mut next.rooms, rooms);
        }
        SyncAction::SyncFailed => {
            next.polling_retries += 1;
            if next.polling_retries >= next.max_retries {
                next.is_polling = false;
            }
        }
        SyncAction::TxnCreated => {
            next.transaction_counter += 1;
        }
        SyncAction::Reset => {
            next.is_polling = false;
            next.polling_retries = 0;
        }
        SyncAction::HardReset => {
            next = SyncState::new(next.max_retries, next.polling_timeout_ms);
        }
    }
    next
}

/// Merge room deltas by id: membership is unioned, never replaced, so a
/// replayed delta is a no-op.
fn merge_rooms(existing: &mut HashMap<String, RelayRoom>, deltas: Vec<RelayRoom>) {
    for delta in deltas {
        match existing.get_mut(&delta.id) {
            Some(room) => {
                if delta.state != RoomState::Unknown {
                    room.state = delta.state;
                }
                for member in &delta.members {
                    room.add_member(member);
                }
            }
            None => {
                existing.insert(delta.id.clone(), delta);
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("not authenticated with relay")]
    NotAuthenticated,
    #[error("relay request failed: {0}")]
    Http(String),
    #[error("relay payload malformed: {0}")]
    Codec(String),
    #[error("max sync retries exceeded, polling requires explicit restart")]
    MaxSyncRetriesExceeded,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<HttpError> for SyncError {
    fn from(error: HttpError) -> Self {
        SyncError::Http(error.to_string())
    }
}

/// Deterministic relay credentials for this identity
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub user: String,
    pub password: String,
    pub device_id: String,
}

/// One successful sync cycle
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub token: String,
    pub rooms: Vec<RelayRoom>,
    pub events: Vec<RelayEvent>,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySyncConfig {
    /// Long-poll timeout hint passed to `/sync`
    pub polling_timeout_ms: u64,
    /// Pause between failed sync attempts
    pub retry_interval_ms: u64,
    /// Consecutive failures before polling stops for good
    pub max_sync_retries: u32,
}

impl Default for RelaySyncConfig {
    fn default() -> Self {
        Self {
            polling_timeout_ms: 30_000,
            retry_interval_ms: 1_000,
            max_sync_retries: 5,
        }
    }
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncBatch, SyncError>>>;

/// A session against one relay node
pub struct RelaySyncEngine {
    node: String,
    http: Arc<dyn HttpClient>,
    store: Arc<dyn SettingsStore>,
    state: Mutex<SyncState>,
    events_tx: broadcast::Sender<RelayEvent>,
    initial_batch: Mutex<Vec<RelayEvent>>,
    in_flight: Mutex<Option<SharedSync>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    retry_interval_ms: u64,
}

impl RelaySyncEngine {
    pub fn new(
        node: String,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn SettingsStore>,
        config: RelaySyncConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            node,
            http,
            store,
            state: Mutex::new(SyncState::new(
                config.max_sync_retries,
                config.polling_timeout_ms,
            )),
            events_tx,
            initial_batch: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            poll_task: Mutex::new(None),
            retry_interval_ms: config.retry_interval_ms,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().is_polling
    }

    pub fn rooms(&self) -> Vec<RelayRoom> {
        self.state.lock().rooms.values().cloned().collect()
    }

    pub fn room(&self, room_id: &str) -> Option<RelayRoom> {
        self.state.lock().rooms.get(room_id).cloned()
    }

    /// Apply an action through the serialized reducer
    fn apply(&self, action: SyncAction) {
        let mut guard = self.state.lock();
        let next = reduce(guard.clone(), action);
        *guard = next;
    }

    /// Subscribe to relay events: the one-shot initial batch (drained once,
    /// for late subscribers) plus the live feed.
    pub fn subscribe(&self) -> (Vec<RelayEvent>, broadcast::Receiver<RelayEvent>) {
        let buffered = std::mem::take(&mut *self.initial_batch.lock());
        (buffered, self.events_tx.subscribe())
    }

    /// Authenticate and start the poll loop. Previously persisted sync
    /// token and rooms are hydrated first so polling resumes where it left
    /// off instead of re-scanning history.
    pub async fn start(self: &Arc<Self>, credentials: LoginCredentials) -> Result<(), SyncError> {
        let persisted_token = self.store.sync_token().await?;
        let persisted_rooms = self.store.rooms().await?;
        if persisted_token.is_some() || !persisted_rooms.is_empty() {
            debug!(node = %self.node, "resuming from persisted sync state");
            self.apply(SyncAction::SyncSucceeded {
                token: persisted_token,
                timeout_ms: None,
                rooms: persisted_rooms,
            });
        }

        let request = LoginRequest {
            user: credentials.user,
            password: credentials.password,
            device_id: credentials.device_id,
        };
        let raw = self
            .http
            .post(
                &base_url(&self.node),
                api::LOGIN_PATH,
                &[],
                Some(codec::to_json(&request).map_err(|e| SyncError::Codec(e.to_string()))?),
                None,
            )
            .await?;
        let response: LoginResponse =
            codec::from_json(&raw).map_err(|e| SyncError::Codec(e.to_string()))?;
        info!(node = %self.node, user = %response.user_id, "relay login complete");

        self.apply(SyncAction::Init {
            user_id: response.user_id,
            device_id: response.device_id,
            access_token: response.access_token,
        });

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.poll_loop().await;
        });
        *self.poll_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the poll scope. Already-merged state stays valid; a new
    /// `start` is required to resume.
    pub fn stop_polling(&self) {
        self.apply(SyncAction::Reset);
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut first_batch = true;
        loop {
            if !self.is_polling() {
                break;
            }
            match self.sync().await {
                Ok(batch) => {
                    self.apply(SyncAction::SyncSucceeded {
                        token: Some(batch.token.clone()),
                        timeout_ms: None,
                        rooms: batch.rooms,
                    });
                    if let Err(error) = self.persist_sync_state(&batch.token).await {
                        warn!(%error, "failed to persist sync state");
                    }
                    if first_batch {
                        first_batch = false;
                        self.initial_batch
                            .lock()
                            .extend(batch.events.iter().cloned());
                    }
                    for event in batch.events {
                        let _ = self.events_tx.send(event);
                    }
                }
                Err(error) => {
                    warn!(%error, node = %self.node, "sync failed");
                    self.apply(SyncAction::SyncFailed);
                    if !self.is_polling() {
                        warn!(node = %self.node, "max sync retries exceeded, polling stopped");
                        break;
                    }
                    if self.retry_interval_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.retry_interval_ms,
                        ))
                        .await;
                    }
                }
            }
        }
    }

    async fn persist_sync_state(&self, token: &str) -> Result<(), StoreError> {
        self.store.set_sync_token(token).await?;
        let rooms = self.rooms();
        self.store.set_rooms(&rooms).await
    }

    /// One incremental sync. Concurrent callers share a single in-flight
    /// request and observe its result instead of issuing their own.
    pub async fn sync(&self) -> Result<SyncBatch, SyncError> {
        {
            let state = self.state.lock();
            if !state.is_polling && state.polling_retries >= state.max_retries {
                return Err(SyncError::MaxSyncRetriesExceeded);
            }
        }

        let shared = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let (access_token, since, timeout_ms) = {
                        let state = self.state.lock();
                        (
                            state.access_token.clone(),
                            state.sync_token.clone(),
                            state.polling_timeout_ms,
                        )
                    };
                    let access_token = access_token.ok_or(SyncError::NotAuthenticated)?;
                    let http = Arc::clone(&self.http);
                    let node = self.node.clone();
                    let future = async move {
                        fetch_sync(http, node, access_token, since, timeout_ms).await
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };

        let result = shared.await;
        *self.in_flight.lock() = None;
        result
    }

    /// Create a room holding exactly the invited users and this session
    pub async fn create_room(&self, invitees: &[String]) -> Result<String, SyncError> {
        let request = CreateRoomRequest {
            invite: invitees.to_vec(),
        };
        let raw = self
            .http
            .post(
                &base_url(&self.node),
                api::CREATE_ROOM_PATH,
                &self.auth()?,
                Some(codec::to_json(&request).map_err(|e| SyncError::Codec(e.to_string()))?),
                None,
            )
            .await?;
        let response: CreateRoomResponse =
            codec::from_json(&raw).map_err(|e| SyncError::Codec(e.to_string()))?;
        debug!(room = %response.room_id, "room created");
        Ok(response.room_id)
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<(), SyncError> {
        let request = InviteRequest {
            user_id: user_id.to_string(),
        };
        self.http
            .post(
                &base_url(&self.node),
                &api::invite_path(room_id),
                &self.auth()?,
                Some(codec::to_json(&request).map_err(|e| SyncError::Codec(e.to_string()))?),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn join(&self, room_id: &str) -> Result<(), SyncError> {
        self.http
            .post(
                &base_url(&self.node),
                &api::join_path(room_id),
                &self.auth()?,
                None,
                None,
            )
            .await?;
        Ok(())
    }

    /// Send a text event. The transaction id is generated once per logical
    /// send and never reused, so relay-side retries of the same call are
    /// idempotent.
    pub async fn send_text(&self, room_id: &str, body: &str) -> Result<String, SyncError> {
        let txn_id = self.create_txn_id();
        let request = SendRequest::text(body.to_string());
        let raw = self
            .http
            .put(
                &base_url(&self.node),
                &api::send_path(room_id, api::EVENT_TYPE_MESSAGE, &txn_id),
                &self.auth()?,
                Some(codec::to_json(&request).map_err(|e| SyncError::Codec(e.to_string()))?),
                None,
            )
            .await?;
        let response: SendResponse =
            codec::from_json(&raw).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(response.event_id)
    }

    /// Monotonically-unique transaction id: `m<millis>.<counter>`
    fn create_txn_id(&self) -> String {
        let counter = {
            let mut guard = self.state.lock();
            let counter = guard.transaction_counter;
            let next = reduce(guard.clone(), SyncAction::TxnCreated);
            *guard = next;
            counter
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("m{millis}.{counter}")
    }

    fn auth(&self) -> Result<Vec<(String, String)>, SyncError> {
        let state = self.state.lock();
        let token = state
            .access_token
            .as_deref()
            .ok_or(SyncError::NotAuthenticated)?;
        Ok(auth_headers(token))
    }
}

async fn fetch_sync(
    http: Arc<dyn HttpClient>,
    node: String,
    access_token: String,
    since: Option<String>,
    timeout_ms: u64,
) -> Result<SyncBatch, SyncError> {
    let mut params = vec![("timeout".to_string(), timeout_ms.to_string())];
    if let Some(since) = since {
        params.push(("since".to_string(), since));
    }

    let raw = http
        .get(
            &base_url(&node),
            api::SYNC_PATH,
            &auth_headers(&access_token),
            &params,
            Some(timeout_ms + 10_000),
        )
        .await?;
    let response: SyncResponse =
        codec::from_json(&raw).map_err(|e| SyncError::Codec(e.to_string()))?;

    let token = response.next_batch.clone();
    let (rooms, events) = response.into_rooms_and_events();
    Ok(SyncBatch {
        token,
        rooms,
        events,
    })
}
