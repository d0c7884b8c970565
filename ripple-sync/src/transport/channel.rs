use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};
use tracing::{debug, error, info, warn};

use super::messages::WireMessage;
use super::{ConnectionState, TransportEvent};
use crate::models::{Message, MessageContent};

/// Delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Spawn the event-channel task: one WebSocket connection to the relay with
/// automatic reconnects. Room subscriptions are tracked across reconnects
/// and replayed onto every fresh connection.
pub fn spawn(
    relay_url: String,
    self_id: String,
    mut join_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        // Rooms survive reconnects; every (re)connect replays them
        let mut rooms: HashSet<String> = HashSet::new();

        loop {
            // Check for shutdown before attempting connection
            if shutdown_rx.try_recv().is_ok() {
                info!("Shutdown signal received, stopping reconnection");
                break;
            }

            set_state(&state_tx, &events, ConnectionState::Connecting);
            info!(url = %relay_url, "Connecting to relay");

            match connect_async(&relay_url).await {
                Ok((ws_stream, _)) => {
                    let (mut ws_write, mut ws_read) = ws_stream.split();

                    // Identify ourselves and wait for the auth response
                    let connect_msg = WireMessage::Connect {
                        user_id: self_id.clone(),
                    };
                    let connect_json = serde_json::to_string(&connect_msg).unwrap();

                    if ws_write.send(Frame::Text(connect_json.into())).await.is_err() {
                        error!("Failed to send connect frame");
                        set_state(&state_tx, &events, ConnectionState::Disconnected);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }

                    let mut authenticated = false;
                    if let Some(Ok(Frame::Text(response))) = ws_read.next().await {
                        if let Ok(msg) = serde_json::from_str::<WireMessage>(&response) {
                            match msg {
                                WireMessage::AuthResponse { success, message } => {
                                    if success {
                                        info!("Authenticated with relay: {}", message);
                                        authenticated = true;
                                    } else {
                                        error!("Relay rejected connection: {}", message);
                                    }
                                }
                                _ => {
                                    warn!("Unexpected frame during auth");
                                }
                            }
                        }
                    }
                    if !authenticated {
                        set_state(&state_tx, &events, ConnectionState::Disconnected);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }

                    // Re-subscribe every tracked room on this fresh connection
                    let mut resubscribed = true;
                    for peer_id in &rooms {
                        if send_join(&mut ws_write, &self_id, peer_id).await.is_err() {
                            error!(peer_id = %peer_id, "Failed to re-join room");
                            resubscribed = false;
                            break;
                        }
                    }
                    if !resubscribed {
                        set_state(&state_tx, &events, ConnectionState::Disconnected);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }

                    set_state(&state_tx, &events, ConnectionState::Connected);

                    // Frame loop
                    let mut keep_running = true;
                    loop {
                        tokio::select! {
                            // Check for shutdown signal
                            _ = shutdown_rx.recv() => {
                                info!("Shutdown signal received, closing connection gracefully");
                                if let Err(e) = ws_write.send(Frame::Close(None)).await {
                                    warn!(error = %e, "Failed to send close frame");
                                }
                                keep_running = false;
                                break;
                            }
                            // Room subscriptions requested by the engine
                            Some(peer_id) = join_rx.recv() => {
                                // Idempotent: a room already tracked is not re-joined
                                if rooms.insert(peer_id.clone()) {
                                    if send_join(&mut ws_write, &self_id, &peer_id).await.is_err() {
                                        error!(peer_id = %peer_id, "Failed to send join frame");
                                        break;
                                    }
                                } else {
                                    debug!(peer_id = %peer_id, "Room already joined, skipping");
                                }
                            }
                            // Receive incoming frames
                            frame = ws_read.next() => {
                                match frame {
                                    Some(Ok(Frame::Text(text))) => {
                                        handle_frame(&text, &self_id, &events);
                                    }
                                    Some(Ok(Frame::Close(_))) | None => {
                                        info!("Relay closed connection");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        error!(error = %e, "WebSocket error");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }

                    set_state(&state_tx, &events, ConnectionState::Disconnected);
                    info!("Disconnected from relay");

                    if !keep_running {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, url = %relay_url, "Failed to connect to relay");
                    set_state(&state_tx, &events, ConnectionState::Disconnected);
                }
            }

            // Reconnect after delay
            debug!("Reconnecting in 3 seconds");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Frame,
>;

async fn send_join(
    ws_write: &mut WsSink,
    self_id: &str,
    peer_id: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let join_msg = WireMessage::JoinRoom {
        user_id: self_id.to_string(),
        peer_id: peer_id.to_string(),
    };
    let json = serde_json::to_string(&join_msg).unwrap();
    ws_write.send(Frame::Text(json.into())).await
}

/// Normalize one inbound frame into the internal event stream
fn handle_frame(raw: &str, self_id: &str, events: &mpsc::UnboundedSender<TransportEvent>) {
    match serde_json::from_str::<WireMessage>(raw) {
        Ok(WireMessage::Chat {
            id,
            sender_id,
            peer_id,
            text,
            created_at,
        }) => {
            let timestamp = match created_at.parse() {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Discarding chat frame with bad timestamp");
                    return;
                }
            };
            // The conversation peer is the other party: the sender for
            // incoming messages, the recipient for echoes of our own
            let conversation_peer = if sender_id == self_id {
                peer_id
            } else {
                sender_id.clone()
            };
            let message = Message::confirmed(id, sender_id, MessageContent::parse(&text), timestamp);
            let _ = events.send(TransportEvent::MessageReceived {
                peer_id: conversation_peer,
                message,
            });
        }
        Ok(WireMessage::Error { message }) => {
            warn!("Relay error: {}", message);
        }
        Ok(_) => {
            debug!("Ignoring non-chat frame");
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse relay frame");
        }
    }
}

fn set_state(
    state_tx: &watch::Sender<ConnectionState>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    state: ConnectionState,
) {
    let changed = state_tx.send_if_modified(|current| {
        if *current != state {
            *current = state;
            true
        } else {
            false
        }
    });
    if changed {
        let _ = events.send(TransportEvent::ConnectionChanged(state));
    }
}
