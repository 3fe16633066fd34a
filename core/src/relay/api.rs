//! Relay wire protocol — request/response bodies and event derivation
//!
//! The endpoint set is fixed by the target relay network:
//! `POST /login`, `POST /createRoom`, `POST /rooms/{id}/invite`,
//! `POST /rooms/{id}/join`, `GET /sync?since&timeout`,
//! `PUT /rooms/{id}/send/{eventType}/{txnId}`. Authenticated calls carry a
//! bearer header.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::sync::{RelayEvent, RelayRoom, RoomState};

/// Room event type for text payloads
pub const EVENT_TYPE_MESSAGE: &str = "m.room.message";

pub const LOGIN_PATH: &str = "/login";
pub const CREATE_ROOM_PATH: &str = "/createRoom";
pub const SYNC_PATH: &str = "/sync";

pub fn invite_path(room_id: &str) -> String {
    format!("/rooms/{room_id}/invite")
}

pub fn join_path(room_id: &str) -> String {
    format!("/rooms/{room_id}/join")
}

pub fn send_path(room_id: &str, event_type: &str, txn_id: &str) -> String {
    format!("/rooms/{room_id}/send/{event_type}/{txn_id}")
}

/// Bearer-style authorization header for authenticated calls
pub fn auth_headers(access_token: &str) -> Vec<(String, String)> {
    vec![(
        "Authorization".to_string(),
        format!("Bearer {access_token}"),
    )]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    /// Relay users invited at creation; rooms here always hold exactly the
    /// two pairing parties
    #[serde(default)]
    pub invite: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub msgtype: String,
    pub body: String,
}

impl SendRequest {
    pub fn text(body: String) -> Self {
        Self {
            msgtype: "m.text".to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub event_id: String,
}

/// Incremental state returned by `GET /sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: RoomsDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsDelta {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomDelta>,
    #[serde(default)]
    pub invite: HashMap<String, InvitedRoomDelta>,
    #[serde(default)]
    pub leave: HashMap<String, LeftRoomDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomDelta {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: EventList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomDelta {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoomDelta {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: EventList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: String,
    #[serde(default)]
    pub content: EventContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msgtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
}

impl SyncResponse {
    /// Break a sync delta into room snapshots (for the state machine) and
    /// replayable events, in the order the relay returned them.
    pub fn into_rooms_and_events(self) -> (Vec<RelayRoom>, Vec<RelayEvent>) {
        let mut rooms = Vec::new();
        let mut events = Vec::new();

        for (room_id, delta) in self.rooms.join {
            let mut room = RelayRoom::new(room_id.clone(), RoomState::Joined);
            for event in delta.state.events.iter().chain(delta.timeline.events.iter()) {
                collect_member(&mut room, event);
                derive_event(&room_id, event, &mut events);
            }
            rooms.push(room);
        }

        for (room_id, delta) in self.rooms.invite {
            let mut room = RelayRoom::new(room_id.clone(), RoomState::Invited);
            for event in &delta.invite_state.events {
                collect_member(&mut room, event);
                derive_event(&room_id, event, &mut events);
            }
            rooms.push(room);
        }

        for (room_id, delta) in self.rooms.leave {
            let mut room = RelayRoom::new(room_id.clone(), RoomState::Left);
            for event in delta.state.events.iter().chain(delta.timeline.events.iter()) {
                collect_member(&mut room, event);
            }
            rooms.push(room);
        }

        (rooms, events)
    }
}

fn collect_member(room: &mut RelayRoom, event: &RoomEvent) {
    if event.event_type == "m.room.member" {
        if let Some(user_id) = event.state_key.as_deref() {
            room.add_member(user_id);
        }
    }
    room.add_member(&event.sender);
}

fn derive_event(room_id: &str, event: &RoomEvent, out: &mut Vec<RelayEvent>) {
    match event.event_type.as_str() {
        "m.room.create" => {
            let creator = event
                .content
                .creator
                .clone()
                .unwrap_or_else(|| event.sender.clone());
            out.push(RelayEvent::Create { creator });
        }
        "m.room.member" => match event.content.membership.as_deref() {
            Some("join") => out.push(RelayEvent::Join {
                room_id: room_id.to_string(),
                user_id: event
                    .state_key
                    .clone()
                    .unwrap_or_else(|| event.sender.clone()),
            }),
            Some("invite") => out.push(RelayEvent::Invite {
                room_id: room_id.to_string(),
                sender: event.sender.clone(),
            }),
            _ => {}
        },
        "m.room.message" => {
            if let Some(body) = event.content.body.clone() {
                out.push(RelayEvent::TextMessage {
                    room_id: room_id.to_string(),
                    sender: event.sender.clone(),
                    body,
                });
            }
        }
        _ => {}
    }
}
