use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DisplayMessage, RosterUser};

/// Inbound WS frames. The serde tag doubles as the dispatch table: each
/// variant maps to one typed handler in the socket loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    #[serde(rename_all = "camelCase")]
    Msg {
        text: String,
        #[serde(default)]
        reply_to_message_id: Option<Uuid>,
        #[serde(default)]
        client_temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReactionAdd { message_id: Uuid, emoji: String },
    #[serde(rename_all = "camelCase")]
    ReactionRemove { message_id: Uuid, emoji: String },
}

impl ClientFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Outbound WS frames. `Display` flattens the chat envelope; the rest are
/// presence and reaction deltas plus transport plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong,
    Display(DisplayMessage),
    #[serde(rename_all = "camelCase")]
    ReactionAdded {
        message_id: Uuid,
        emoji: String,
        user_id: Uuid,
        handle: String,
    },
    #[serde(rename_all = "camelCase")]
    ReactionRemoved {
        message_id: Uuid,
        emoji: String,
        user_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        room: String,
        user_id: Uuid,
        handle: String,
        joined_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { room: String, user_id: Uuid },
    Roster {
        room: String,
        users: Vec<RosterUser>,
    },
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"serialization failure"}"#.to_string()
        })
    }
}
