use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ConversationSummary, Message, MessageContent, Thread};

/// The conversation store collaborator: the authority for conversation
/// lists, thread history, and message persistence.
///
/// Implementations own their transport and timeout/retry policy; an error
/// returned here is terminal for that one operation and never rolls back
/// engine state.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch the authoritative conversation list
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Fetch (creating if needed) the full thread with one peer
    async fn get_or_create_thread(&self, peer_id: &str) -> Result<Thread, StoreError>;

    /// Append a message; returns the server-confirmed message with the
    /// authoritative id and timestamp
    async fn send_message(
        &self,
        peer_id: &str,
        content: &MessageContent,
    ) -> Result<Message, StoreError>;
}

/// Supplies the current user's stable identifier
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> String;
}

impl IdentityProvider for String {
    fn current_user_id(&self) -> String {
        self.clone()
    }
}
