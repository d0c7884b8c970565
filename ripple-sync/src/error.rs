use thiserror::Error;

/// Error reported by the conversation store collaborator. The store owns its
/// own timeout/retry policy; by the time this surfaces, the operation has
/// terminally failed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<String> for StoreError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for StoreError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Failure taxonomy for the sync engine.
///
/// Nothing here is fatal to the process: transport errors degrade to the
/// other delivery mode, fetch and send errors stay scoped to one view or
/// one message, and a failed ledger write leaves the in-memory read-state
/// authoritative for the session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Event-channel connect or subscribe failure. Recovered by falling
    /// back to polling or reconnecting with backoff; never user-facing.
    #[error("transport error: {0}")]
    Transport(String),

    /// Conversation list or thread fetch failed. Retryable per view.
    #[error("fetch failed: {0}")]
    Fetch(#[source] StoreError),

    /// Message send failed. Surfaced on the message's delivery state and
    /// recoverable by an explicit retry.
    #[error("send failed: {0}")]
    Send(#[source] StoreError),

    /// Durable read-state write failed
    #[error("read-state write failed: {0}")]
    LedgerWrite(#[from] rusqlite::Error),

    /// Operation input rejected before any state change
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine task is gone; the command was not delivered
    #[error("engine unavailable")]
    EngineGone,
}
