//! Feed notification stream.
//!
//! Architecture:
//! - Observers call `subscribe()` and get their own channel receiver
//! - The manager publishes while holding its state lock, so events for one
//!   item arrive in transition order
//! - Publishing never runs observer code, so an observer may call back into
//!   the manager without deadlocking
//!
//! Events are level-triggered hints: payloads say *what* changed, observers
//! re-read current state through the manager rather than diffing payloads.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use log::trace;

use super::item::{ItemId, LifecycleState};

/// Something observable changed in the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// New record inserted at the front of the ordering index
    ItemAdded { id: ItemId },
    /// Record transitioned to `state`
    StateChanged { id: ItemId, state: LifecycleState },
    /// Record destroyed (removed from map and ordering index)
    ItemRemoved { id: ItemId },
    /// Focused item changed
    FocusChanged { index: usize },
}

/// Fan-out publisher of `FeedEvent`s over unbounded channels.
#[derive(Debug, Default)]
pub struct FeedEvents {
    subscribers: Mutex<Vec<Sender<FeedEvent>>>,
}

impl FeedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// New observer. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<FeedEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, pruning disconnected ones
    pub fn publish(&self, event: FeedEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.is_empty() {
            return;
        }
        trace!("FeedEvent: {:?}", event);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
