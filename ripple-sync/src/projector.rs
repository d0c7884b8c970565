//! Derives the externally-exposed read models from engine state.

use tokio::sync::watch;

use crate::models::{ConversationSummary, ThreadView};

/// Publisher for the two presentation read models.
///
/// Recomputed views are compared by value before publishing, so running the
/// projection twice over the same internal state never notifies subscribers
/// a second time.
pub struct Projector {
    list_tx: watch::Sender<Vec<ConversationSummary>>,
    thread_tx: watch::Sender<Option<ThreadView>>,
}

impl Projector {
    pub fn new(
        list_tx: watch::Sender<Vec<ConversationSummary>>,
        thread_tx: watch::Sender<Option<ThreadView>>,
    ) -> Self {
        Self { list_tx, thread_tx }
    }

    pub fn publish(&self, list: Vec<ConversationSummary>, thread: Option<ThreadView>) {
        self.list_tx.send_if_modified(|current| {
            if *current != list {
                *current = list;
                true
            } else {
                false
            }
        });
        self.thread_tx.send_if_modified(|current| {
            if *current != thread {
                *current = thread;
                true
            } else {
                false
            }
        });
    }
}
