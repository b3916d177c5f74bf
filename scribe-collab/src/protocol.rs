//! JSON wire protocol for room sessions.
//!
//! One frame per WebSocket text message. `type` discriminates, fields are
//! camelCase:
//!
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! join {roomId,userId,displayName,color}   init {document,revision,presence}
//! operation {operation,revision}           operation {operation,revision,userId}
//! cursor {position}                        cursor_update {userId,position}
//! typing {isTyping}                        typing_update {userId,isTyping}
//! resync                                   presence_update {presence,full}
//! ping                                     error {code,message}
//!                                          pong
//! ```
//!
//! The acknowledgment of a submitted operation is an ordinary `operation`
//! frame whose `userId` is the submitter's own.

use chrono::{DateTime, Utc};
use scribe_core::Operation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Room-scoped identity of a connecting user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    /// CSS color string, e.g. `#3fa7d6`.
    pub color: String,
}

impl JoinRequest {
    /// Join with a color derived from the user id.
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let color = crate::presence::color_for(&user_id);
        Self {
            room_id: room_id.into(),
            user_id,
            display_name: display_name.into(),
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Offline,
}

/// One roster entry. At most one per (room, userId).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub status: PresenceStatus,
    pub cursor_position: Option<usize>,
    pub is_typing: bool,
    pub last_activity: DateTime<Utc>,
}

impl SessionEntry {
    pub fn online(request: &JoinRequest) -> Self {
        Self {
            user_id: request.user_id.clone(),
            display_name: request.display_name.clone(),
            color: request.color.clone(),
            status: PresenceStatus::Online,
            cursor_position: None,
            is_typing: false,
            last_activity: Utc::now(),
        }
    }
}

/// Machine-readable reason carried by an `error` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Submitted revision is newer than the room's.
    RevisionAhead,
    /// Submitted revision fell out of the trailing history window.
    RevisionTooOld,
    /// Operation does not fit the document.
    OutOfBounds,
    RoomFull,
    /// The room shut down while the join was in progress.
    RoomClosed,
    /// A frame other than `join` arrived before joining.
    NotJoined,
    BadFrame,
    /// The session's outbound queue overflowed; it was detached.
    Lagged,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join(JoinRequest),
    Operation {
        operation: Operation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<u64>,
    },
    Cursor {
        /// Ignored by the server; the session already knows who it is.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        position: Option<usize>,
    },
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        is_typing: bool,
    },
    Resync,
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Init {
        document: String,
        revision: u64,
        presence: Vec<SessionEntry>,
    },
    Operation {
        operation: Operation,
        revision: u64,
        user_id: String,
    },
    CursorUpdate {
        user_id: String,
        position: Option<usize>,
    },
    TypingUpdate {
        user_id: String,
        is_typing: bool,
    },
    PresenceUpdate {
        presence: Vec<SessionEntry>,
        full: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ClientMessage {
    pub fn submit(operation: Operation, revision: u64) -> Self {
        Self::Operation {
            operation,
            revision: Some(revision),
        }
    }

    pub fn cursor(position: Option<usize>) -> Self {
        Self::Cursor {
            user_id: None,
            position,
        }
    }

    pub fn typing(is_typing: bool) -> Self {
        Self::Typing {
            user_id: None,
            is_typing,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected")]
    NotConnected,
}
