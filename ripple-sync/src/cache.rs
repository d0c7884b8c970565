//! In-memory thread cache: the last-fetched ordered message sequence per
//! peer, plus each peer's lifecycle state within the engine.
//!
//! Threads are never evicted; fresher server data always supersedes them
//! wholesale. Messages are ordered by timestamp with ties kept in insertion
//! order, and unresolved local entries (pending or failed sends) stay at the
//! tail until the store resolves them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{DeliveryState, Message, Peer};

/// Lifecycle of one peer's cached thread. Absence from the cache is the
/// initial, unloaded state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThreadState {
    Cached,
    Open,
}

/// What happened to an incoming message when folded into the cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    /// New message, inserted in timestamp order
    Appended,
    /// Matched an outstanding optimistic send and replaced it in place
    Reconciled,
    /// Already present; dropped
    Duplicate,
}

pub struct CachedThread {
    pub peer: Peer,
    pub messages: Vec<Message>,
    pub state: ThreadState,
}

pub struct ThreadCache {
    threads: HashMap<String, CachedThread>,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
        }
    }

    pub fn state(&self, peer_id: &str) -> Option<ThreadState> {
        self.threads.get(peer_id).map(|t| t.state)
    }

    pub fn messages(&self, peer_id: &str) -> Option<&[Message]> {
        self.threads.get(peer_id).map(|t| t.messages.as_slice())
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.threads.get(peer_id).map(|t| &t.peer)
    }

    pub fn latest(&self, peer_id: &str) -> Option<&Message> {
        self.threads.get(peer_id).and_then(|t| t.messages.last())
    }

    pub fn newest_timestamp(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.latest(peer_id).map(|m| m.timestamp)
    }

    pub fn contains_message(&self, peer_id: &str, message_id: &str) -> bool {
        self.threads
            .get(peer_id)
            .map(|t| t.messages.iter().any(|m| m.id == message_id))
            .unwrap_or(false)
    }

    /// Create an empty cached thread for `peer` if none exists yet
    /// (a conversation starts on the first outgoing message)
    pub fn ensure(&mut self, peer: Peer) {
        self.threads.entry(peer.id.clone()).or_insert(CachedThread {
            peer,
            messages: Vec::new(),
            state: ThreadState::Cached,
        });
    }

    pub fn set_state(&mut self, peer_id: &str, state: ThreadState) {
        if let Some(thread) = self.threads.get_mut(peer_id) {
            thread.state = state;
        }
    }

    /// Replace the cached sequence wholesale with fresher server data.
    /// Unresolved local sends (pending or failed) that the server does not
    /// know about yet are carried over so no user input is lost.
    pub fn replace(&mut self, peer: Peer, mut messages: Vec<Message>, state: ThreadState) {
        messages.sort_by_key(|m| m.timestamp);

        if let Some(old) = self.threads.get(&peer.id) {
            for message in &old.messages {
                if message.delivery != DeliveryState::Confirmed
                    && !messages.iter().any(|m| m.id == message.id)
                {
                    messages.push(message.clone());
                }
            }
        }

        self.threads.insert(
            peer.id.clone(),
            CachedThread {
                peer,
                messages,
                state,
            },
        );
    }

    /// Append an optimistic local send; it sorts as the newest element
    /// until confirmed or failed
    pub fn append_local(&mut self, peer_id: &str, message: Message) {
        if let Some(thread) = self.threads.get_mut(peer_id) {
            thread.messages.push(message);
        }
    }

    /// Fold a transport-delivered message into the cached sequence.
    /// Deduplicates by id; an echo of the current user's own optimistic send
    /// replaces the matching pending entry in place instead of appending.
    pub fn upsert_incoming(
        &mut self,
        peer_id: &str,
        self_id: &str,
        message: Message,
    ) -> UpsertOutcome {
        let Some(thread) = self.threads.get_mut(peer_id) else {
            return UpsertOutcome::Duplicate;
        };

        if let Some(pos) = thread.messages.iter().position(|m| m.id == message.id) {
            if thread.messages[pos].is_pending() && message.delivery == DeliveryState::Confirmed {
                thread.messages[pos] = message;
                return UpsertOutcome::Reconciled;
            }
            return UpsertOutcome::Duplicate;
        }

        if message.sender_id == self_id {
            // Most recent outstanding pending send with matching content
            let echo_of = thread
                .messages
                .iter()
                .rposition(|m| m.is_pending() && m.sender_id == self_id && m.content == message.content);
            if let Some(pos) = echo_of {
                thread.messages[pos] = message;
                return UpsertOutcome::Reconciled;
            }
        }

        insert_confirmed(&mut thread.messages, message);
        UpsertOutcome::Appended
    }

    /// Swap a provisional message for its server-confirmed form without
    /// moving it. Returns true when the thread now holds the confirmed
    /// message (including when a transport echo got there first).
    pub fn confirm(&mut self, peer_id: &str, provisional_id: &str, confirmed: Message) -> bool {
        let Some(thread) = self.threads.get_mut(peer_id) else {
            return false;
        };
        if let Some(pos) = thread.messages.iter().position(|m| m.id == provisional_id) {
            thread.messages[pos] = confirmed;
            return true;
        }
        thread.messages.iter().any(|m| m.id == confirmed.id)
    }

    /// Mark a provisional message as failed; it stays in the thread
    pub fn fail(&mut self, peer_id: &str, message_id: &str) -> bool {
        if let Some(thread) = self.threads.get_mut(peer_id) {
            if let Some(message) = thread.messages.iter_mut().find(|m| m.id == message_id) {
                message.delivery = DeliveryState::Failed;
                return true;
            }
        }
        false
    }

    /// Put a failed send back into flight; returns a clone for re-issuing
    pub fn reset_pending(&mut self, peer_id: &str, message_id: &str) -> Option<Message> {
        let thread = self.threads.get_mut(peer_id)?;
        let message = thread
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.delivery == DeliveryState::Failed)?;
        message.delivery = DeliveryState::Pending;
        Some(message.clone())
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert a confirmed message keeping confirmed entries ordered by
/// timestamp; unresolved local entries stay at the tail
fn insert_confirmed(messages: &mut Vec<Message>, message: Message) {
    let tail_start = messages
        .iter()
        .position(|m| m.delivery != DeliveryState::Confirmed)
        .unwrap_or(messages.len());

    let mut idx = tail_start;
    while idx > 0
        && messages[idx - 1].delivery == DeliveryState::Confirmed
        && messages[idx - 1].timestamp > message.timestamp
    {
        idx -= 1;
    }
    messages.insert(idx, message);
}
