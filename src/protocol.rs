#![forbid(unsafe_code)]

// Chat protocol - message shapes exchanged with the chat service over WebSocket

use crate::config::RoomId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type the service uses for chat broadcasts (and outbound chat messages)
pub const CHAT_EVENT: &str = "message";

/// Client-to-Server messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to a room's broadcasts. Fire-and-forget: the service sends no ack.
    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId },
    /// Unsubscribe from a room
    #[serde(rename_all = "camelCase")]
    Leave { room_id: RoomId },
    /// Post a chat message to a room
    #[serde(rename_all = "camelCase")]
    Message {
        room_id: RoomId,
        content: String,
        /// Echoed back by the service as `clientGeneratedId`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn join(room_id: &RoomId) -> Self {
        Self::Join {
            room_id: room_id.clone(),
        }
    }

    pub fn leave(room_id: &RoomId) -> Self {
        Self::Leave {
            room_id: room_id.clone(),
        }
    }

    pub fn chat(room_id: &RoomId, tag: &ContentTag) -> Self {
        Self::Message {
            room_id: room_id.clone(),
            content: tag.content(),
            client_id: Some(tag.client_id()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Anything the service pushes to a client: a type tag plus an untyped payload.
///
/// Only `message` events are inspected; everything else (presence, errors, events
/// added to the service later) is carried through untouched so it can be skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundEvent {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Build a chat broadcast the way the service shapes it
    pub fn chat(payload: &ChatPayload) -> Self {
        Self {
            kind: CHAT_EVENT.to_string(),
            data: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn is_chat(&self) -> bool {
        self.kind == CHAT_EVENT
    }

    /// `data.content` of a chat broadcast, if this is one
    pub fn chat_content(&self) -> Option<&str> {
        if !self.is_chat() {
            return None;
        }
        self.data.get("content")?.as_str()
    }

    /// Whether this is the broadcast of exactly `content`
    pub fn is_echo_of(&self, content: &str) -> bool {
        self.chat_content() == Some(content)
    }

    /// Typed view of a chat broadcast's payload
    pub fn chat_payload(&self) -> Option<ChatPayload> {
        if !self.is_chat() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Payload of a persisted chat message as broadcast by the service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChatUser>,
    #[serde(
        default,
        rename = "clientGeneratedId",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_generated_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(default)]
    pub id: Option<String>,
    pub username: String,
}

/// Identifies one chat message of one session of one run.
///
/// Echo matching is plain string equality on the rendered content, so the content
/// embeds every component: two sessions of the same user (same user in two rooms,
/// or listed twice) differ by `session`, and broadcasts left over from an earlier
/// run in the same room differ by `run_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentTag {
    pub run_id: String,
    pub session: usize,
    pub username: String,
    /// 1-based index of the message within the session
    pub sequence: usize,
}

impl ContentTag {
    pub fn new(run_id: &str, session: usize, username: &str, sequence: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            session,
            username: username.to_string(),
            sequence,
        }
    }

    pub fn content(&self) -> String {
        format!(
            "Message {} from {} [{}:{}]",
            self.sequence, self.username, self.run_id, self.session
        )
    }

    pub fn client_id(&self) -> String {
        format!("{}:{}:{}", self.run_id, self.session, self.sequence)
    }
}

/// Short random identifier distinguishing this harness run from earlier ones
pub fn new_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
