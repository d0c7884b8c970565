use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::messages::WireMessage;
use crate::state::RelayState;

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Wait for Connect frame to identify the client
    let user_id = match wait_for_connect(&mut ws_receiver).await {
        Some(id) => id,
        None => {
            warn!("Connection closed before identification");
            return;
        }
    };

    info!("User connected: {}", user_id);

    // Create channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Register client
    state.add_client(user_id.clone(), tx);

    // Send auth success response
    let auth_response = WireMessage::AuthResponse {
        success: true,
        message: "Connected to relay".to_string(),
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!("Failed to send auth response to {}: {}", user_id, e);
            }
        }
        Err(e) => {
            error!("Failed to serialize auth response for {}: {}", user_id, e);
        }
    }

    // Flush frames queued while this user was unreachable
    flush_queued(&state, &user_id);

    // Spawn task to forward frames from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Process incoming frames and monitor the send task
    let user_id_clone = user_id.clone();
    let state_clone = state.clone();

    loop {
        tokio::select! {
            // Branch 1: Read from WebSocket
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &user_id_clone, &state_clone);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("User {} sent close frame", user_id_clone);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = data;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for user {}: {}", user_id_clone, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended for user {}", user_id_clone);
                        break;
                    }
                    _ => {}
                }
            }
            // Branch 2: Monitor send task (write errors)
            _ = &mut send_task => {
                info!("Send task finished for user {} (likely connection lost)", user_id_clone);
                break;
            }
        }
    }

    // Cleanup
    send_task.abort();
    state.remove_client(&user_id);

    info!("User disconnected: {}", user_id);
}

/// Wait for the Connect frame from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Option<String> {
    // Give the client 10 seconds to identify itself
    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                match serde_json::from_str::<WireMessage>(&text) {
                    Ok(WireMessage::Connect { user_id }) => {
                        return Some(user_id);
                    }
                    Ok(_) => {
                        warn!("Expected connect frame, got something else");
                    }
                    Err(e) => {
                        warn!("Failed to parse connect frame: {}", e);
                    }
                }
            }
        }
        None
    });

    match timeout.await {
        Ok(result) => result,
        Err(_) => {
            warn!("Identification timeout");
            None
        }
    }
}

/// Handle an incoming frame from an identified client
pub fn handle_frame(text: &str, sender_id: &str, state: &RelayState) {
    let mut msg: WireMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse frame from {}: {}", sender_id, e);
            return;
        }
    };

    // Enforce sender identity to prevent spoofing
    match &mut msg {
        WireMessage::Chat { sender_id: sid, .. } => *sid = sender_id.to_string(),
        WireMessage::JoinRoom { user_id, .. } => *user_id = sender_id.to_string(),
        // Server-only or handshake frames carry no spoofable identity here
        WireMessage::Connect { .. } | WireMessage::AuthResponse { .. } | WireMessage::Error { .. } => {}
    }

    match &msg {
        WireMessage::JoinRoom { user_id, peer_id } => {
            if state.join_room(user_id, peer_id) {
                info!("User {} joined room with {}", user_id, peer_id);
            } else {
                debug!("User {} already in room with {}, ignoring", user_id, peer_id);
            }
            // Joining makes the user reachable for queued traffic
            flush_queued(state, user_id);
        }
        WireMessage::Chat { peer_id, .. } => {
            // Re-serialize the identity-enforced frame
            let safe_text = match serde_json::to_string(&msg) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to re-serialize frame from {}: {}", sender_id, e);
                    return;
                }
            };
            // Route to the conversation peer (queues if unreachable)
            state.route_chat(sender_id, peer_id, &safe_text);
        }
        WireMessage::Connect { .. } => {
            // Already identified, ignore
        }
        WireMessage::AuthResponse { .. } | WireMessage::Error { .. } => {
            // Server-only frames, ignore from clients
        }
    }
}

/// Deliver every frame queued for `user_id`
fn flush_queued(state: &RelayState, user_id: &str) {
    let queued = state.take_queued_frames(user_id);
    if !queued.is_empty() {
        info!("Delivering {} queued frames to {}", queued.len(), user_id);
        for frame in queued {
            state.send_to_user(user_id, &frame);
        }
    }
}
