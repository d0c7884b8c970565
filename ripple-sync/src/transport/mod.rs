//! Transport adapter: two delivery modes, one normalized event stream.
//!
//! The event channel is preferred; the interval poller runs only while the
//! channel is not connected. The engine consumes `TransportEvent`s without
//! ever learning which mode produced them.

mod channel;
mod messages;
mod poller;

pub use messages::WireMessage;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use crate::config::SyncConfig;
use crate::models::{ConversationSummary, Message};
use crate::store::ConversationStore;

/// Event-channel connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Normalized event emitted by whichever delivery mode is live
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One logical chat event. `peer_id` is the conversation peer from the
    /// current user's perspective.
    MessageReceived { peer_id: String, message: Message },
    /// A fresh authoritative conversation list (polling mode)
    ListRefreshed(Vec<ConversationSummary>),
    ConnectionChanged(ConnectionState),
}

/// Handle owned by the engine. The tasks keep running if this is dropped;
/// call `shutdown` to stop them.
pub struct Transport {
    join_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Spawn the event channel and the polling fallback. Both feed `events`;
    /// at most one of them is live at any instant.
    pub fn spawn(
        config: &SyncConfig,
        self_id: String,
        store: Arc<dyn ConversationStore>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        channel::spawn(
            config.relay_url.clone(),
            self_id.clone(),
            join_rx,
            state_tx,
            events.clone(),
            shutdown_tx.subscribe(),
        );

        poller::spawn(
            config.poll_interval,
            self_id,
            store,
            state_rx,
            events,
            shutdown_tx.subscribe(),
        );

        Self {
            join_tx,
            shutdown_tx,
        }
    }

    /// Subscribe to the room shared with `peer_id`. Idempotent; safe to
    /// call repeatedly for the same peer.
    pub fn join_room(&self, peer_id: &str) {
        let _ = self.join_tx.send(peer_id.to_string());
    }

    /// Stop both delivery modes
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
