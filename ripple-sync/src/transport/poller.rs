use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use super::{ConnectionState, TransportEvent};
use crate::store::ConversationStore;

/// Spawn the polling-fallback task: a full conversation-list re-fetch on a
/// fixed interval, diffed against the previous snapshot to synthesize the
/// events the channel would have produced. Parks itself whenever the event
/// channel reaches Connected so only one delivery mode is ever live.
pub fn spawn(
    interval: Duration,
    self_id: String,
    store: Arc<dyn ConversationStore>,
    mut state_rx: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        // Last activity seen per peer, for the new-message diff
        let mut seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut first_poll = true;

        loop {
            if *state_rx.borrow() == ConnectionState::Connected {
                // Channel mode is live; park until that changes
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // The snapshot is kept across the parked stretch: on
                        // resume, anything push delivery already covered is
                        // deduplicated downstream by message id
                        continue;
                    }
                }
            }

            match store.list_conversations().await {
                Ok(list) => {
                    // The channel may have come up mid-fetch; emitting now
                    // would double-process against push delivery
                    if *state_rx.borrow() == ConnectionState::Connected {
                        continue;
                    }

                    if !first_poll {
                        for summary in &list {
                            let Some(message) = &summary.last_message else {
                                continue;
                            };
                            if message.sender_id == self_id {
                                continue;
                            }
                            let newer = seen
                                .get(&summary.peer.id)
                                .map(|ts| message.timestamp > *ts)
                                .unwrap_or(true);
                            if newer {
                                debug!(peer_id = %summary.peer.id, "Synthesizing message event from list diff");
                                let _ = events.send(TransportEvent::MessageReceived {
                                    peer_id: summary.peer.id.clone(),
                                    message: message.clone(),
                                });
                            }
                        }
                    }
                    first_poll = false;

                    for summary in &list {
                        if let Some(message) = &summary.last_message {
                            seen.insert(summary.peer.id.clone(), message.timestamp);
                        }
                    }

                    let _ = events.send(TransportEvent::ListRefreshed(list));
                }
                Err(e) => {
                    warn!(error = %e, "Polling list fetch failed");
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Poller stopped");
    });
}
