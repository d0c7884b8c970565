use serde::{Deserialize, Serialize};

/// The opposite party in a one-to-one conversation. Display attributes are
/// immutable within a snapshot and refreshed wholesale from the store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub premium: bool,
}
