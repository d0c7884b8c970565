//! Real-time conversation synchronization engine.
//!
//! Maintains a client-visible, eventually-consistent view of many two-party
//! conversations fed by two delivery modes — a push WebSocket event channel
//! and an interval-polling fallback — while applying optimistic local sends
//! and reconciling them against store-confirmed state.
//!
//! The conversation store and the identity provider are external
//! collaborators supplied by the caller; presentation code consumes the two
//! live view models through [`SyncClient`].

mod cache;
mod config;
mod engine;
mod error;
mod ledger;
mod models;
mod projector;
mod store;
mod transport;
pub mod unread;

pub use config::SyncConfig;
pub use engine::{SyncClient, SyncEngine};
pub use error::{StoreError, SyncError};
pub use ledger::ReadStateLedger;
pub use models::input::{OpenThreadInput, SendMessageInput, ValidateExt};
pub use models::{
    ConversationSummary, DeliveryState, Message, MessageContent, Peer, Thread, ThreadPhase,
    ThreadView,
};
pub use store::{ConversationStore, IdentityProvider};
pub use transport::{ConnectionState, WireMessage};
