use serde::{Deserialize, Serialize};

/// Wire frames exchanged with the relay (JSON text frames)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "connect")]
    Connect { user_id: String },
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "join_room")]
    JoinRoom { user_id: String, peer_id: String },
    #[serde(rename = "message")]
    Chat {
        id: String,
        sender_id: String,
        peer_id: String,
        text: String,
        created_at: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}
