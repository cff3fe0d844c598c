//! Wire frame definitions
//!
//! Chat and typing frames share one WebSocket channel and carry no common
//! discriminator, so inbound bytes are told apart by structural probing:
//! a frame whose `type` is `typing_start` or `typing_stop` is a typing
//! frame, anything else that parses as an object is a chat frame.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AppError;

/// Encoded frame shared between every client queue of one fan-out
pub type OutboundFrame = Arc<str>;

/// Chat message frame
///
/// Inbound, only `content` is trusted. Before fan-out the server overwrites
/// `username`/`avatar` with the resolved profile and `timestamp` with
/// server time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatFrame {
    #[serde(deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: String,
    /// Avatar URL, empty when the sender has none
    #[serde(deserialize_with = "null_as_default")]
    pub avatar: String,
}

/// Typing indicator kind (`type` field on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingKind {
    TypingStart,
    TypingStop,
}

impl TypingKind {
    /// Parse the wire value; only the two exact strings are typing kinds
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "typing_start" => Some(Self::TypingStart),
            "typing_stop" => Some(Self::TypingStop),
            _ => None,
        }
    }

    pub fn is_typing(self) -> bool {
        matches!(self, Self::TypingStart)
    }
}

/// Typing indicator frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypingFrame {
    pub username: String,
    pub is_typing: bool,
    #[serde(rename = "type")]
    pub kind: TypingKind,
}

impl TypingFrame {
    /// Build a frame whose `is_typing` agrees with its kind
    pub fn new(username: impl Into<String>, kind: TypingKind) -> Self {
        Self {
            username: username.into(),
            is_typing: kind.is_typing(),
            kind,
        }
    }

    /// Synthesized stop frame for a user who just sent a chat message
    pub fn stop(username: impl Into<String>) -> Self {
        Self::new(username, TypingKind::TypingStop)
    }
}

/// Loose shape used to probe for a typing frame
///
/// `type` stays a plain string so that unknown kinds fall through to chat
/// handling instead of failing the probe outright.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypingProbe {
    #[serde(deserialize_with = "null_as_default")]
    username: String,
    #[serde(deserialize_with = "null_as_default")]
    is_typing: bool,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    kind: String,
}

/// Treat an explicit `null` like a missing field
///
/// Logged-out browser clients send `"username": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A decoded client → server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Typing(TypingFrame),
    Chat(ChatFrame),
}

/// Decode one inbound frame
///
/// Returns `AppError::Json` for malformed bytes and `AppError::EmptyContent`
/// for a chat frame without content. Both are recoverable for the caller.
pub fn decode(bytes: &[u8]) -> Result<InboundFrame, AppError> {
    if let Ok(probe) = serde_json::from_slice::<TypingProbe>(bytes) {
        if let Some(kind) = TypingKind::from_wire(&probe.kind) {
            return Ok(InboundFrame::Typing(TypingFrame {
                username: probe.username,
                is_typing: probe.is_typing,
                kind,
            }));
        }
    }

    let chat: ChatFrame = serde_json::from_slice(bytes)?;
    if chat.content.is_empty() {
        return Err(AppError::EmptyContent);
    }
    Ok(InboundFrame::Chat(chat))
}

/// Encode a frame once for fan-out
pub fn encode<T: Serialize>(frame: &T) -> Result<OutboundFrame, AppError> {
    Ok(Arc::from(serde_json::to_string(frame)?))
}

/// One entry of the online users listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineUser {
    pub username: String,
    pub avatar: String,
}

/// Response body for the online users query endpoint
#[derive(Debug, Clone, Serialize)]
pub struct OnlineUsers {
    pub users: Vec<OnlineUser>,
    pub count: usize,
}

impl From<Vec<OnlineUser>> for OnlineUsers {
    fn from(users: Vec<OnlineUser>) -> Self {
        let count = users.len();
        Self { users, count }
    }
}
