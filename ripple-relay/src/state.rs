use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

/// Maximum queued frames per user to prevent unbounded memory growth
const MAX_QUEUED_FRAMES_PER_USER: usize = 1000;

/// Generate a deterministic room ID from two user IDs
/// This ensures both parties compute the same room regardless of who joins first
pub fn room_id(user_id_1: &str, user_id_2: &str) -> String {
    let mut ids = [user_id_1, user_id_2];
    ids.sort_unstable();
    let raw = format!("room_{}_{}", ids[0], ids[1]);

    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Relay state managing connected clients, room membership, and frames
/// queued for users that cannot be reached yet
pub struct RelayState {
    /// user_id -> list of sender channels (supports multiple connections per user)
    pub clients: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    /// room id -> member user ids; membership is a set, so joining twice is a no-op
    rooms: DashMap<String, HashSet<String>>,
    /// user_id -> frames awaiting delivery
    queued_frames: DashMap<String, Vec<String>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
            queued_frames: DashMap::new(),
        }
    }

    /// Register a new client connection (supports multiple connections per user)
    pub fn add_client(&self, user_id: String, tx: mpsc::UnboundedSender<String>) {
        self.clients
            .entry(user_id)
            .or_insert_with(Vec::new)
            .push(tx);
    }

    /// Remove a specific client connection by checking if the channel is closed
    pub fn remove_client(&self, user_id: &str) {
        if let Some(mut entry) = self.clients.get_mut(user_id) {
            // Remove closed channels
            entry.retain(|tx| !tx.is_closed());
            // If no channels left, remove the user entry
            if entry.is_empty() {
                drop(entry);
                self.clients.remove(user_id);
            }
        }
    }

    /// Send a frame to a specific user (sends to all their connections)
    pub fn send_to_user(&self, user_id: &str, frame: &str) -> bool {
        if let Some(channels) = self.clients.get(user_id) {
            let mut sent = false;
            for tx in channels.iter() {
                if tx.send(frame.to_string()).is_ok() {
                    sent = true;
                }
            }
            sent
        } else {
            false
        }
    }

    /// Check if a user is online
    pub fn is_online(&self, user_id: &str) -> bool {
        self.clients
            .get(user_id)
            .map(|channels| !channels.is_empty())
            .unwrap_or(false)
    }

    /// Add `user_id` to the room it shares with `peer_id`.
    /// Returns true on first join, false when already a member.
    pub fn join_room(&self, user_id: &str, peer_id: &str) -> bool {
        self.rooms
            .entry(room_id(user_id, peer_id))
            .or_default()
            .insert(user_id.to_string())
    }

    /// Check whether `user_id` is a member of the room it shares with `peer_id`
    pub fn in_room(&self, user_id: &str, peer_id: &str) -> bool {
        self.rooms
            .get(&room_id(user_id, peer_id))
            .map(|members| members.contains(user_id))
            .unwrap_or(false)
    }

    /// Route a chat frame to its recipient: delivered once per live
    /// connection when the recipient has joined the shared room, queued
    /// otherwise. Returns true if delivered immediately, false if queued.
    pub fn route_chat(&self, sender_id: &str, recipient_id: &str, frame: &str) -> bool {
        if self.in_room(recipient_id, sender_id) && self.send_to_user(recipient_id, frame) {
            true
        } else {
            self.queue_frame(recipient_id, frame.to_string());
            info!("Queued frame for unreachable user {}", recipient_id);
            false
        }
    }

    /// Queue a frame for a user that cannot be reached yet
    fn queue_frame(&self, user_id: &str, frame: String) {
        let mut entry = self
            .queued_frames
            .entry(user_id.to_string())
            .or_insert_with(Vec::new);

        // Enforce queue limit - drop oldest if at capacity
        if entry.len() >= MAX_QUEUED_FRAMES_PER_USER {
            entry.remove(0);
            info!("Queue limit reached for {}, dropped oldest frame", user_id);
        }
        entry.push(frame);
    }

    /// Take all queued frames for a user (clears the queue)
    pub fn take_queued_frames(&self, user_id: &str) -> Vec<String> {
        self.queued_frames
            .remove(user_id)
            .map(|(_, frames)| frames)
            .unwrap_or_default()
    }

    /// Get the number of queued frames for a user
    pub fn queued_count(&self, user_id: &str) -> usize {
        self.queued_frames
            .get(user_id)
            .map(|frames| frames.len())
            .unwrap_or(0)
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}
