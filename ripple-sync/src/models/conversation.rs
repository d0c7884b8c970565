use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::peer::Peer;

/// List-view projection of one conversation
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationSummary {
    pub peer: Peer,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.timestamp)
    }

    pub fn last_sender_id(&self) -> Option<&str> {
        self.last_message.as_ref().map(|m| m.sender_id.as_str())
    }

    pub fn preview(&self) -> Option<String> {
        self.last_message.as_ref().map(|m| m.content.preview())
    }
}

/// Full ordered message history with one peer, as returned by the store
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Thread {
    pub peer: Peer,
    pub messages: Vec<Message>,
}

/// Lifecycle of the open-thread view. A failed fetch is retryable by
/// reopening the thread; it never takes the engine down.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPhase {
    Loading,
    Ready,
    Failed,
}

/// Presentation model for the currently open thread
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ThreadView {
    pub peer_id: String,
    pub peer: Option<Peer>,
    pub messages: Vec<Message>,
    pub phase: ThreadPhase,
}
