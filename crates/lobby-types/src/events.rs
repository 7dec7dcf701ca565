use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageId, MessageKind};

/// Events sent FROM server TO client over a chat connection.
/// Clients key on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted in the room
    ChatMessage {
        user: String,
        message: String,
        message_type: MessageKind,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },

    /// Direct-chat history, sent once right after joining
    PreviousMessages { messages: Vec<HistoryEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageKind,
}

impl ServerEvent {
    pub fn chat_message(message: &Message) -> Self {
        Self::ChatMessage {
            user: message.author_username.clone(),
            message: message.content.clone().unwrap_or_default(),
            message_type: message.kind,
            timestamp: message.created_at,
            file: message.file.clone(),
        }
    }

    /// Returns `None` for an empty history: nothing is sent in that case.
    pub fn previous_messages(history: &[Message]) -> Option<Self> {
        if history.is_empty() {
            return None;
        }

        let messages = history
            .iter()
            .map(|m| HistoryEntry {
                user: m.author_username.clone(),
                message: m.content.clone().unwrap_or_default(),
                timestamp: m.created_at,
                message_type: m.kind,
            })
            .collect();

        Some(Self::PreviousMessages { messages })
    }

    /// Store-assigned timestamp of a live message event.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::ChatMessage { timestamp, .. } => Some(*timestamp),
            Self::PreviousMessages { .. } => None,
        }
    }
}

/// Inbound frame on a room-chat connection.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomFrame {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub parent: Option<MessageId>,
}

/// Inbound frame on a direct-chat connection. Always a text message.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectFrame {
    pub message: String,
}
