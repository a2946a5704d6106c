//! JSON wire protocol.
//!
//! Every frame is one JSON object sharing a single envelope shape. Inbound
//! envelopes are decoded into the closed [`InboundMessage`] union at this
//! boundary; unknown or missing `type` tags never reach the router. Outbound
//! traffic is built as [`OutboundMessage`] and flattened back into the
//! envelope on encode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{FileMeta, MessageKind, MessageStatus, StoredMessage, User};

/// Flat envelope shared by both directions. Server-assigned fields are
/// never read from client frames.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WireEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<User>>,
}

/// Content-carrying kinds that share the plain chat dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Text,
    Image,
    Emoji,
}

impl ChatKind {
    pub fn stored_kind(self) -> MessageKind {
        match self {
            Self::Text => MessageKind::Text,
            Self::Image => MessageKind::Image,
            Self::Emoji => MessageKind::Emoji,
        }
    }
}

/// A decoded client frame. Sender identity is never taken from the frame;
/// the session supplies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Chat { kind: ChatKind, content: String },
    File { content: String, file: FileMeta },
    Recall { message_id: i64 },
    Rename { username: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl InboundMessage {
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let envelope: WireEnvelope = serde_json::from_str(frame)?;
        let kind = envelope.kind.ok_or(DecodeError::MissingType)?;

        let content = envelope.content.unwrap_or_default();
        let message = match kind.as_str() {
            "text" => Self::Chat {
                kind: ChatKind::Text,
                content,
            },
            "image" => Self::Chat {
                kind: ChatKind::Image,
                content,
            },
            "emoji" => Self::Chat {
                kind: ChatKind::Emoji,
                content,
            },
            "file" => Self::File {
                content,
                file: FileMeta {
                    name: envelope.file_name.unwrap_or_default(),
                    size: envelope.file_size.unwrap_or_default(),
                },
            },
            "recall" => Self::Recall {
                message_id: envelope.message_id.unwrap_or_default(),
            },
            "user" => Self::Rename {
                username: envelope.username.unwrap_or_default(),
            },
            _ => return Err(DecodeError::UnknownType(kind)),
        };
        Ok(message)
    }
}

/// Who sent a chat message, resolved by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub user_id: i64,
    pub username: String,
    pub ip: String,
}

/// Chat message as fanned out to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub sender: Sender,
    pub content: String,
    pub file: Option<FileMeta>,
    /// Present once persisted; recall needs it.
    pub message_id: Option<i64>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Mirror the store's id and timestamp into the outbound copy.
    pub fn persisted(mut self, stored: &StoredMessage) -> Self {
        self.message_id = Some(stored.id);
        self.created_at = stored.created_at;
        self.status = stored.status;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Chat(ChatMessage),
    System {
        content: String,
        created_at: DateTime<Utc>,
    },
    Recall {
        message_id: i64,
        user_id: i64,
        username: String,
        created_at: DateTime<Utc>,
    },
    UserRename {
        user_id: i64,
        username: String,
    },
    PresenceList(Vec<User>),
}

impl OutboundMessage {
    pub fn system(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::System {
            content: content.into(),
            created_at,
        }
    }

    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(chat) => chat.kind.as_str(),
            Self::System { .. } => "system",
            Self::Recall { .. } => "recall",
            Self::UserRename { .. } => "user",
            Self::PresenceList(_) => "users",
        }
    }

    pub fn to_envelope(&self) -> WireEnvelope {
        let kind = Some(self.kind().to_string());
        match self {
            Self::Chat(chat) => WireEnvelope {
                kind,
                content: Some(chat.content.clone()),
                username: Some(chat.sender.username.clone()),
                user_id: Some(chat.sender.user_id),
                ip: Some(chat.sender.ip.clone()),
                message_id: chat.message_id,
                file_name: chat.file.as_ref().map(|f| f.name.clone()),
                file_size: chat.file.as_ref().map(|f| f.size),
                status: Some(chat.status.code()),
                created_at: Some(chat.created_at),
                data: None,
            },
            Self::System {
                content,
                created_at,
            } => WireEnvelope {
                kind,
                content: Some(content.clone()),
                created_at: Some(*created_at),
                ..Default::default()
            },
            Self::Recall {
                message_id,
                user_id,
                username,
                created_at,
            } => WireEnvelope {
                kind,
                message_id: Some(*message_id),
                user_id: Some(*user_id),
                username: Some(username.clone()),
                status: Some(MessageStatus::Recalled.code()),
                created_at: Some(*created_at),
                ..Default::default()
            },
            Self::UserRename { user_id, username } => WireEnvelope {
                kind,
                user_id: Some(*user_id),
                username: Some(username.clone()),
                ..Default::default()
            },
            Self::PresenceList(users) => WireEnvelope {
                kind,
                data: Some(users.clone()),
                ..Default::default()
            },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }
}
