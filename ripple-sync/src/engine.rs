//! The reconciliation engine: the single owner of all mutable sync state.
//!
//! Transport events, presentation commands, and completions of spawned
//! store calls all funnel into one task and are handled one at a time, so
//! interleavings are deterministic and nothing races on the thread cache or
//! the read-state ledger. Store calls themselves run on spawned tasks and
//! post their results back into the same loop; nothing here ever blocks the
//! presentation layer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::{ThreadCache, ThreadState};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ledger::ReadStateLedger;
use crate::models::input::{OpenThreadInput, SendMessageInput, ValidateExt};
use crate::models::{
    ConversationSummary, DeliveryState, Message, MessageContent, Peer, Thread, ThreadPhase,
    ThreadView,
};
use crate::projector::Projector;
use crate::store::{ConversationStore, IdentityProvider};
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::unread::{self, UnreadTally};

/// Imperative operations accepted by the engine
#[derive(Debug)]
enum Command {
    Refresh,
    OpenThread { peer_id: String },
    CloseThread,
    Send { peer_id: String, content: MessageContent },
    RetrySend { peer_id: String, message_id: String },
    Shutdown,
}

/// Completions posted back by spawned store calls
enum Completion {
    ListFetched {
        result: Result<Vec<ConversationSummary>, SyncError>,
    },
    ThreadFetched {
        peer_id: String,
        generation: u64,
        opened: bool,
        result: Result<Thread, SyncError>,
    },
    SendResolved {
        peer_id: String,
        provisional_id: String,
        result: Result<Message, SyncError>,
    },
}

/// Per-peer list-entry state owned by the engine
struct SummaryState {
    peer: Peer,
    last_message: Option<Message>,
    unread: UnreadTally,
}

/// Presentation-layer handle to a running engine. Cheap to clone; all
/// methods are fire-and-forget commands or live view subscriptions.
#[derive(Clone)]
pub struct SyncClient {
    command_tx: mpsc::UnboundedSender<Command>,
    list_rx: watch::Receiver<Vec<ConversationSummary>>,
    thread_rx: watch::Receiver<Option<ThreadView>>,
}

impl SyncClient {
    /// Live conversation-list view, sorted by last activity. The receiver
    /// always holds the latest projection.
    pub fn conversation_list(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.list_rx.clone()
    }

    /// Open the thread with `peer_id` and return the live thread view.
    /// The authoritative history is re-fetched and unread drops to zero.
    pub fn open_thread(&self, peer_id: &str) -> Result<watch::Receiver<Option<ThreadView>>, SyncError> {
        let input = OpenThreadInput {
            peer_id: peer_id.to_string(),
        };
        input.validate_input()?;
        self.command(Command::OpenThread {
            peer_id: input.peer_id,
        })?;
        Ok(self.thread_rx.clone())
    }

    /// Navigate back to the list; the open thread reverts to cached
    pub fn close_thread(&self) -> Result<(), SyncError> {
        self.command(Command::CloseThread)
    }

    /// Optimistic fire-and-forget send. The message appears immediately as
    /// pending; a failure surfaces on its delivery state, never as a crash.
    pub fn send(&self, peer_id: &str, content: &str) -> Result<(), SyncError> {
        let input = SendMessageInput {
            peer_id: peer_id.to_string(),
            content: content.to_string(),
        };
        input.validate_input()?;
        self.command(Command::Send {
            peer_id: input.peer_id,
            content: MessageContent::parse(&input.content),
        })
    }

    /// Re-issue a send that previously failed
    pub fn retry_send(&self, peer_id: &str, message_id: &str) -> Result<(), SyncError> {
        self.command(Command::RetrySend {
            peer_id: peer_id.to_string(),
            message_id: message_id.to_string(),
        })
    }

    /// Ask for a fresh authoritative conversation list
    pub fn refresh(&self) -> Result<(), SyncError> {
        self.command(Command::Refresh)
    }

    /// Stop the engine and its transport tasks
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        self.command_tx
            .send(command)
            .map_err(|_| SyncError::EngineGone)
    }
}

pub struct SyncEngine {
    self_id: String,
    store: Arc<dyn ConversationStore>,
    ledger: ReadStateLedger,
    transport: Transport,
    cache: ThreadCache,
    summaries: HashMap<String, SummaryState>,
    /// Peer whose thread is currently open, if any
    open_peer: Option<String>,
    /// Open-request generation; thread fetches carrying a stale one are discarded
    open_generation: u64,
    open_phase: ThreadPhase,
    /// Peers with a background exactness fetch already in flight
    refreshing: HashSet<String>,
    projector: Projector,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl SyncEngine {
    /// Spawn the engine and its transport; returns the presentation handle
    pub fn spawn(
        config: SyncConfig,
        store: Arc<dyn ConversationStore>,
        identity: &dyn IdentityProvider,
    ) -> Result<SyncClient, SyncError> {
        let ledger = match &config.ledger_path {
            Some(path) => ReadStateLedger::open(path)?,
            None => ReadStateLedger::in_memory()?,
        };

        let self_id = identity.current_user_id();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (list_tx, list_rx) = watch::channel(Vec::new());
        let (thread_tx, thread_rx) = watch::channel(None);

        let transport = Transport::spawn(&config, self_id.clone(), store.clone(), transport_tx);

        let engine = SyncEngine {
            self_id,
            store,
            ledger,
            transport,
            cache: ThreadCache::new(),
            summaries: HashMap::new(),
            open_peer: None,
            open_generation: 0,
            open_phase: ThreadPhase::Loading,
            refreshing: HashSet::new(),
            projector: Projector::new(list_tx, thread_tx),
            completion_tx,
        };

        tokio::spawn(engine.run(command_rx, transport_rx, completion_rx));

        Ok(SyncClient {
            command_tx,
            list_rx,
            thread_rx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        // Push delivery alone cannot provide history: load the list now
        self.request_list_refresh();

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if matches!(command, Command::Shutdown) {
                        info!("Shutting down sync engine");
                        self.transport.shutdown();
                        break;
                    }
                    self.handle_command(command);
                }
                Some(event) = transport_events.recv() => {
                    self.handle_transport(event);
                }
                Some(completion) = completions.recv() => {
                    self.handle_completion(completion);
                }
                else => break,
            }
            // One committed transition per queued event, then one recompute
            self.project();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh => self.request_list_refresh(),
            Command::OpenThread { peer_id } => self.open_thread(peer_id),
            Command::CloseThread => self.close_thread(),
            Command::Send { peer_id, content } => self.send_message(peer_id, content),
            Command::RetrySend {
                peer_id,
                message_id,
            } => self.retry_send(peer_id, message_id),
            Command::Shutdown => {}
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived { peer_id, message } => {
                self.on_message(peer_id, message);
            }
            TransportEvent::ListRefreshed(list) => self.apply_list(list),
            TransportEvent::ConnectionChanged(state) => {
                debug!(?state, "Transport connection state changed");
                if state == ConnectionState::Connected {
                    // Catch up on anything missed while push mode was down
                    self.request_list_refresh();
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ListFetched { result } => match result {
                Ok(list) => self.apply_list(list),
                Err(e) => warn!(error = %e, "Conversation list fetch failed"),
            },
            Completion::ThreadFetched {
                peer_id,
                generation,
                opened,
                result,
            } => self.on_thread_fetched(peer_id, generation, opened, result),
            Completion::SendResolved {
                peer_id,
                provisional_id,
                result,
            } => self.on_send_resolved(peer_id, provisional_id, result),
        }
    }

    // --- Imperative operations -------------------------------------------

    fn request_list_refresh(&self) {
        let store = self.store.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store.list_conversations().await.map_err(SyncError::Fetch);
            let _ = tx.send(Completion::ListFetched { result });
        });
    }

    fn open_thread(&mut self, peer_id: String) {
        // Switching threads invalidates any fetch still in flight for the
        // previously selected one
        self.open_generation += 1;

        if let Some(previous) = self.open_peer.take() {
            if previous != peer_id {
                self.cache.set_state(&previous, ThreadState::Cached);
            }
        }
        self.open_peer = Some(peer_id.clone());
        self.open_phase = ThreadPhase::Loading;
        self.cache.set_state(&peer_id, ThreadState::Open);

        self.transport.join_room(&peer_id);
        self.spawn_thread_fetch(peer_id, self.open_generation, true);
    }

    fn close_thread(&mut self) {
        if let Some(peer_id) = self.open_peer.take() {
            self.cache.set_state(&peer_id, ThreadState::Cached);
        }
        // Whatever open fetch is still in flight no longer has a home
        self.open_generation += 1;
    }

    fn send_message(&mut self, peer_id: String, content: MessageContent) {
        let peer = self
            .summaries
            .get(&peer_id)
            .map(|s| s.peer.clone())
            .unwrap_or_else(|| placeholder_peer(&peer_id));

        // A conversation can start with an outgoing message
        self.cache.ensure(peer);

        let provisional = Message::provisional(&self.self_id, content.clone());
        self.cache.append_local(&peer_id, provisional.clone());
        self.update_summary_head(&peer_id, provisional.clone());
        self.transport.join_room(&peer_id);

        self.spawn_send(peer_id, provisional.id, content);
    }

    fn retry_send(&mut self, peer_id: String, message_id: String) {
        let Some(message) = self.cache.reset_pending(&peer_id, &message_id) else {
            warn!(peer_id = %peer_id, message_id = %message_id, "Retry requested for a message that is not failed");
            return;
        };
        if let Some(entry) = self.summaries.get_mut(&peer_id) {
            if let Some(head) = entry.last_message.as_mut() {
                if head.id == message_id {
                    head.delivery = DeliveryState::Pending;
                }
            }
        }
        self.spawn_send(peer_id, message.id, message.content);
    }

    fn spawn_send(&self, peer_id: String, provisional_id: String, content: MessageContent) {
        let store = self.store.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store
                .send_message(&peer_id, &content)
                .await
                .map_err(SyncError::Send);
            let _ = tx.send(Completion::SendResolved {
                peer_id,
                provisional_id,
                result,
            });
        });
    }

    fn spawn_thread_fetch(&self, peer_id: String, generation: u64, opened: bool) {
        let store = self.store.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store
                .get_or_create_thread(&peer_id)
                .await
                .map_err(SyncError::Fetch);
            let _ = tx.send(Completion::ThreadFetched {
                peer_id,
                generation,
                opened,
                result,
            });
        });
    }

    /// Fetch the full thread in the background so a lower-bound unread
    /// tally can be replaced with an exact count
    fn schedule_exactness_fetch(&mut self, peer_id: &str) {
        if self.refreshing.contains(peer_id) {
            return;
        }
        self.refreshing.insert(peer_id.to_string());
        self.spawn_thread_fetch(peer_id.to_string(), self.open_generation, false);
    }

    // --- Event application ------------------------------------------------

    fn on_message(&mut self, peer_id: String, message: Message) {
        // At-most-once across both delivery modes and repeated room joins:
        // anything already absorbed is dropped by id
        if self.is_duplicate(&peer_id, &message.id) {
            debug!(message_id = %message.id, "Suppressing duplicate delivery");
            return;
        }

        let own = message.sender_id == self.self_id;
        let cached = self.cache.state(&peer_id).is_some();
        if cached {
            self.cache
                .upsert_incoming(&peer_id, &self.self_id, message.clone());
        }

        self.update_summary_head(&peer_id, message.clone());

        let open = self.open_peer.as_deref() == Some(peer_id.as_str());
        if open {
            // Reading along: everything up to this message is seen
            self.ledger.mark_read(&peer_id, message.timestamp);
            if let Some(entry) = self.summaries.get_mut(&peer_id) {
                entry.unread.clear();
            }
        } else if !own {
            if cached {
                let exact = unread::count(
                    self.cache.messages(&peer_id).unwrap_or(&[]),
                    &self.self_id,
                    self.ledger.last_read(&peer_id),
                );
                if let Some(entry) = self.summaries.get_mut(&peer_id) {
                    entry.unread.set_exact(exact);
                }
            } else {
                if let Some(entry) = self.summaries.get_mut(&peer_id) {
                    entry.unread.bump();
                }
                // Replace the heuristic with an exact count as soon as the
                // full thread can be loaded
                self.schedule_exactness_fetch(&peer_id);
            }
        }

        // A live conversation implies a room subscription
        self.transport.join_room(&peer_id);
    }

    fn apply_list(&mut self, list: Vec<ConversationSummary>) {
        for summary in list {
            let peer_id = summary.peer.id.clone();
            let first_sight = !self.summaries.contains_key(&peer_id);

            let entry = self
                .summaries
                .entry(peer_id.clone())
                .or_insert_with(|| SummaryState {
                    peer: summary.peer.clone(),
                    last_message: None,
                    unread: UnreadTally::LowerBound(0),
                });

            // Display attributes refresh wholesale
            entry.peer = summary.peer;

            if let Some(message) = summary.last_message {
                // Never clobber a local optimistic head with older store data
                let keep_local = entry
                    .last_message
                    .as_ref()
                    .map(|head| {
                        head.delivery != DeliveryState::Confirmed
                            || head.timestamp >= message.timestamp
                    })
                    .unwrap_or(false);
                if !keep_local {
                    entry.last_message = Some(message);
                }
            }

            match self.cache.state(&peer_id) {
                Some(ThreadState::Open) => {
                    // The open thread is read by definition
                }
                Some(ThreadState::Cached) => {
                    let exact = unread::count(
                        self.cache.messages(&peer_id).unwrap_or(&[]),
                        &self.self_id,
                        self.ledger.last_read(&peer_id),
                    );
                    entry.unread.set_exact(exact);
                }
                None => {
                    if first_sight {
                        // Seed the lower bound from the store's own figure;
                        // afterwards only observed events move it
                        entry.unread.raise_to(summary.unread_count);
                    }
                    if entry.unread.get() > 0 {
                        self.schedule_exactness_fetch(&peer_id);
                    }
                }
            }

            if first_sight {
                self.transport.join_room(&peer_id);
            }
        }
    }

    fn on_thread_fetched(
        &mut self,
        peer_id: String,
        generation: u64,
        opened: bool,
        result: Result<Thread, SyncError>,
    ) {
        self.refreshing.remove(&peer_id);

        if opened
            && (generation != self.open_generation
                || self.open_peer.as_deref() != Some(peer_id.as_str()))
        {
            // The user moved on while this fetch was in flight; letting it
            // land would overwrite the newly selected thread
            debug!(peer_id = %peer_id, "Discarding stale thread fetch");
            return;
        }

        let thread = match result {
            Ok(thread) => thread,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Thread fetch failed");
                if opened {
                    self.open_phase = ThreadPhase::Failed;
                }
                return;
            }
        };

        let state = if opened {
            ThreadState::Open
        } else {
            // A background fetch must not demote a thread opened meanwhile
            match self.cache.state(&peer_id) {
                Some(ThreadState::Open) => ThreadState::Open,
                _ => ThreadState::Cached,
            }
        };

        let peer = thread.peer.clone();
        self.cache.replace(peer.clone(), thread.messages, state);

        let entry = self
            .summaries
            .entry(peer_id.clone())
            .or_insert_with(|| SummaryState {
                peer: peer.clone(),
                last_message: None,
                unread: UnreadTally::LowerBound(0),
            });
        entry.peer = peer;

        // The fetch may have raced with a push delivery the store did not
        // include yet; update_summary_head keeps whichever head is newest
        if let Some(head) = self.cache.latest(&peer_id).cloned() {
            self.update_summary_head(&peer_id, head);
        }

        if state == ThreadState::Open {
            if let Some(newest) = self.cache.newest_timestamp(&peer_id) {
                self.ledger.mark_read(&peer_id, newest);
            }
            if let Some(entry) = self.summaries.get_mut(&peer_id) {
                entry.unread.clear();
            }
            if opened {
                self.open_phase = ThreadPhase::Ready;
            }
        } else {
            let exact = unread::count(
                self.cache.messages(&peer_id).unwrap_or(&[]),
                &self.self_id,
                self.ledger.last_read(&peer_id),
            );
            if let Some(entry) = self.summaries.get_mut(&peer_id) {
                entry.unread.set_exact(exact);
            }
        }
    }

    fn on_send_resolved(
        &mut self,
        peer_id: String,
        provisional_id: String,
        result: Result<Message, SyncError>,
    ) {
        match result {
            Ok(confirmed) => {
                // In-place swap keeps the visible ordering stable
                if !self.cache.confirm(&peer_id, &provisional_id, confirmed.clone()) {
                    debug!(message_id = %provisional_id, "Provisional message already reconciled");
                }
                if let Some(entry) = self.summaries.get_mut(&peer_id) {
                    let head_is_provisional = entry
                        .last_message
                        .as_ref()
                        .map(|head| head.id == provisional_id)
                        .unwrap_or(false);
                    if head_is_provisional {
                        entry.last_message = Some(confirmed);
                    }
                }
            }
            Err(e) => {
                // Surfaced, not masked: the message stays in the thread as
                // failed until the user retries it
                warn!(peer_id = %peer_id, message_id = %provisional_id, error = %e, "Send failed");
                self.cache.fail(&peer_id, &provisional_id);
                if let Some(entry) = self.summaries.get_mut(&peer_id) {
                    if let Some(head) = entry.last_message.as_mut() {
                        if head.id == provisional_id {
                            head.delivery = DeliveryState::Failed;
                        }
                    }
                }
            }
        }
    }

    // --- Helpers -----------------------------------------------------------

    fn is_duplicate(&self, peer_id: &str, message_id: &str) -> bool {
        if self.cache.contains_message(peer_id, message_id) {
            return true;
        }
        self.summaries
            .get(peer_id)
            .and_then(|s| s.last_message.as_ref())
            .map(|head| head.id == message_id)
            .unwrap_or(false)
    }

    fn update_summary_head(&mut self, peer_id: &str, message: Message) {
        let entry = self
            .summaries
            .entry(peer_id.to_string())
            .or_insert_with(|| SummaryState {
                peer: placeholder_peer(peer_id),
                last_message: None,
                unread: UnreadTally::LowerBound(0),
            });

        let replace = match &entry.last_message {
            None => true,
            Some(head) => {
                head.id == message.id
                    || (head.delivery != DeliveryState::Confirmed
                        && message.sender_id == head.sender_id)
                    || message.timestamp >= head.timestamp
            }
        };
        if replace {
            entry.last_message = Some(message);
        }
    }

    fn project(&self) {
        let mut list: Vec<ConversationSummary> = self
            .summaries
            .values()
            .filter(|s| s.last_message.is_some())
            .map(|s| ConversationSummary {
                peer: s.peer.clone(),
                last_message: s.last_message.clone(),
                unread_count: s.unread.get(),
            })
            .collect();
        // Newest activity first; peer id breaks ties deterministically
        list.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.peer.id.cmp(&b.peer.id))
        });

        let thread = self.open_peer.as_ref().map(|peer_id| ThreadView {
            peer_id: peer_id.clone(),
            peer: self
                .summaries
                .get(peer_id)
                .map(|s| s.peer.clone())
                .or_else(|| self.cache.peer(peer_id).cloned()),
            messages: self
                .cache
                .messages(peer_id)
                .map(|m| m.to_vec())
                .unwrap_or_default(),
            phase: self.open_phase,
        });

        self.projector.publish(list, thread);
    }
}

/// Stand-in identity until the store supplies real display data
fn placeholder_peer(peer_id: &str) -> Peer {
    Peer {
        id: peer_id.to_string(),
        name: format!("User {}", &peer_id[..8.min(peer_id.len())]),
        avatar_url: None,
        premium: false,
    }
}
