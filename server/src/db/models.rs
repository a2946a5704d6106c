//! Row types for the chat schema.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs and are
//! shared by both store implementations.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Anonymous user identified by origin address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub ip: String,
    pub username: Option<String>,
    #[serde(rename = "last_online")]
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// Name shown to other clients: the chosen nickname, or the origin address.
    pub fn display_name(&self) -> &str {
        match self.username.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.ip,
        }
    }
}

/// Persisted message kind. Integer codes are the `messages.kind` column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Emoji,
    System,
    File,
}

impl MessageKind {
    pub fn code(self) -> i64 {
        match self {
            Self::Text => 0,
            Self::Image => 1,
            Self::Emoji => 2,
            Self::System => 3,
            Self::File => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Text),
            1 => Some(Self::Image),
            2 => Some(Self::Emoji),
            3 => Some(Self::System),
            4 => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Emoji => "emoji",
            Self::System => "system",
            Self::File => "file",
        }
    }
}

/// Message status flag. Recalled messages keep their row for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Normal,
    Recalled,
}

impl MessageStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Recalled => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            Self::Recalled
        } else {
            Self::Normal
        }
    }
}

impl Serialize for MessageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Attachment metadata carried by file messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: i64,
}

/// Input to `create_message`; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: i64,
    pub kind: MessageKind,
    pub content: String,
    pub file: Option<FileMeta>,
}

/// Message record in the messages table, joined with the sender's username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn file(&self) -> Option<FileMeta> {
        self.file_name.as_ref().map(|name| FileMeta {
            name: name.clone(),
            size: self.file_size.unwrap_or_default(),
        })
    }
}

/// Aggregate counts for the statistics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub user_count: i64,
    pub message_count: i64,
}
