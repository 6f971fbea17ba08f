use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Metadata keys interpreted by the hub. Anything else rides along as a
/// passive annotation.
pub mod meta_key {
    /// Recipient display name; directs the message.
    pub const TO: &str = "to";
    /// `"true"` makes the message a private whisper.
    pub const PRIVATE: &str = "private";
    /// Opaque conversation-thread identifier.
    pub const CONV_ID: &str = "conv_id";
    /// `"true"` triggers spawn dispatch; `"false"` closes the conversation.
    pub const EXPECTING_REPLY: &str = "expecting_reply";
    /// Identifier of a shared file, set by the file collaborator.
    pub const FILE_ID: &str = "file_id";
}

/// One immutable message record, with routing metadata assigned by the room
/// on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub room: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Payload,
    pub seq: i64,
    /// Always present on the wire, possibly empty. Unknown keys are kept.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    /// Convenience accessor for a metadata value, empty when absent.
    pub fn meta(&self, key: &str) -> &str {
        self.metadata.get(key).map(String::as_str).unwrap_or("")
    }

    /// A directed message names a recipient and expects a reply; only these
    /// trigger spawn dispatch.
    pub fn is_directed(&self) -> bool {
        !self.meta(meta_key::TO).is_empty() && self.meta(meta_key::EXPECTING_REPLY) == "true"
    }
}

/// JSON body for `POST /api/rooms/{room}/messages` and for client→server
/// frames on the streaming surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub sender: String,
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response body for message list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageList {
    pub room: String,
    pub messages: Vec<Envelope>,
    pub count: usize,
}

/// One active room, as listed by `GET /api/rooms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub clients: usize,
    pub message_count: usize,
    pub last_seq: i64,
}

/// Response body for `GET /api/rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomList {
    pub rooms: Vec<RoomInfo>,
}

/// Response body for `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: String,
    pub uptime_seconds: f64,
    pub rooms: usize,
}

/// A participant known to a room. The record outlives the connection; only
/// `connected` flips on disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub name: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub connected: bool,
}

/// Response body for `GET /api/rooms/{room}/participants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantList {
    pub room: String,
    pub participants: Vec<ParticipantInfo>,
}

/// A file shared in a room by the file-storage collaborator. Carried on the
/// daemon stream for interop; the hub itself never produces one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub room: String,
    pub sender: String,
    pub filename: String,
    pub size: i64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Server→client frame on a daemon-mode stream, discriminated by `event`:
/// `"message"`, `"spawn"`, or `"file_shared"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnRequest>,
}

impl ServerEvent {
    pub fn message(env: Envelope) -> Self {
        Self {
            event: "message".into(),
            message: Some(env),
            file: None,
            spawn: None,
        }
    }

    pub fn spawn(spawn: SpawnRequest) -> Self {
        Self {
            event: "spawn".into(),
            message: None,
            file: None,
            spawn: Some(spawn),
        }
    }
}

/// Control record instructing a daemon (or in-process hook) to run one agent
/// turn. `context` is a bounded tail of room history, not the full log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub reason: String,
    pub trigger: Envelope,
    pub context: Vec<Envelope>,
    /// All members of the conversation thread, for group threads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
}

impl SpawnRequest {
    /// The conversation thread this signal belongs to, empty when the
    /// trigger was unthreaded.
    pub fn conv_id(&self) -> &str {
        self.trigger.meta(meta_key::CONV_ID)
    }
}
