/// Canonical message and conversation types shared by every engine component
use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// Message identity: assigned by the store, or generated locally for an echo
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Store(String),
    Local(Uuid),
}

impl MessageId {
    /// Fresh temporary id for a message the store has not confirmed yet
    pub fn local() -> Self {
        MessageId::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    /// Parse the string form produced by `Display`
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix(LOCAL_ID_PREFIX) {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                return MessageId::Local(uuid);
            }
        }
        MessageId::Store(raw.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Store(id) => f.write_str(id),
            MessageId::Local(uuid) => write!(f, "{}{}", LOCAL_ID_PREFIX, uuid),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageId::parse(&raw))
    }
}

/// One chat message. Only `read` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// The other participant, relative to `local_user`.
    /// `None` when the local user is on neither side.
    pub fn peer_of(&self, local_user: &str) -> Option<&str> {
        if self.sender_id == local_user {
            Some(&self.receiver_id)
        } else if self.receiver_id == local_user {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Counts towards the owning conversation's unread total
    pub fn is_unread_for(&self, local_user: &str) -> bool {
        self.sender_id != local_user && !self.read
    }

    /// Same participants and payload; used to pair an echo with its confirmation
    pub fn same_payload(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.content == other.content
    }
}

/// Body of a send request, on the push channel and on the fallback POST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

/// Summary of one conversation thread (list view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub peer_id: String,
    pub display_name: String,
    /// Content of the newest message, `None` for an empty shell
    pub last_message: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread_count: usize,
    pub message_count: usize,
}

/// Events published to local subscribers (SSE stream)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A message was inserted or merged into a conversation
    MessageFolded { peer_id: String, message: Message },
    /// Unread count, preview or ordering of a conversation changed
    ConversationUpdated { conversation: ConversationSummary },
    /// Push channel state transition
    TransportState { state: ConnectionState },
    /// Backend did not confirm a read mark; local state kept
    ReadStateSyncFailed { message_id: String, reason: String },
}
