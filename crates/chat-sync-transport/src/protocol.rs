//! Messages the client sends to the server.
//!
//! Incoming frames are decoded by [`chat_sync_core::Envelope`].

use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Post a chat message. The server echoes `local_id` back as `localId`
    /// in the confirming `message` envelope.
    SendMessage {
        local_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    /// Ask the server to load a thread.
    SwitchThread { thread_id: String },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Build a `send_message` request.
    #[must_use]
    pub fn send_message(
        local_id: impl Into<String>,
        content: impl Into<String>,
        thread_id: Option<String>,
    ) -> Self {
        Self::SendMessage {
            local_id: local_id.into(),
            content: content.into(),
            thread_id,
        }
    }
}
