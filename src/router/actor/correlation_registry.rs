//! Correlation bookkeeping for in-flight calls.
//!
//! This module provides the CorrelationRegistry which maps correlation ids to
//! single-use reply slots and delivers replies to their waiters via oneshot
//! channels.
//!
//! # Ownership
//!
//! - The dispatcher calls `register(id)` before publishing and `remove(id)`
//!   when the call returns, whatever the outcome
//! - The reply consumer calls `complete(id, reply)` for each inbound reply
//! - The waiting call awaits its [`ReplySlot`] without holding any mutex

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{LockResultExt, RouterError, RouterResult};
use crate::router::protocol::CorrelationId;

/// Value a reply slot resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome<R> {
    /// The matching reply arrived.
    Fulfilled(R),
    /// No reply will ever arrive (consumer stopped, slot torn down).
    Abandoned(String),
}

/// Observable state of a registered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Fulfilled,
    Abandoned,
}

/// Result of [`CorrelationRegistry::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Reply handed to the waiting call.
    Delivered,
    /// No slot registered under this id (never existed, or already removed).
    UnknownId,
    /// Slot exists but was already fulfilled or abandoned.
    AlreadySettled,
    /// Slot was pending but its waiter had gone away.
    WaiterGone,
}

/// Receiving half of a registered slot, owned by the call that created it.
#[derive(Debug)]
pub struct ReplySlot<R> {
    id: CorrelationId,
    rx: oneshot::Receiver<SlotOutcome<R>>,
}

impl<R> ReplySlot<R> {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait until the slot is settled.
    ///
    /// A slot whose sender disappears without settling (removed from the
    /// registry while pending) resolves to `Abandoned`.
    pub async fn wait(&mut self) -> SlotOutcome<R> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => SlotOutcome::Abandoned("reply slot dropped".to_string()),
        }
    }
}

struct SlotEntry<R> {
    sender: Option<oneshot::Sender<SlotOutcome<R>>>,
    state: SlotState,
}

struct RegistryState<R> {
    slots: HashMap<CorrelationId, SlotEntry<R>>,
    /// Set once the reply consumer stops; new registrations are refused.
    closed: Option<String>,
}

/// Maps correlation ids to reply slots.
///
/// All operations go through a single mutex, so `register`, `complete` and
/// `remove` for the same or different ids never interleave. The map holds only
/// channel handles; decoding happens outside the lock.
pub struct CorrelationRegistry<R> {
    state: Mutex<RegistryState<R>>,
}

impl<R> Default for CorrelationRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> CorrelationRegistry<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Register a pending slot for `id`.
    ///
    /// Must be called before the request is published so a fast reply always
    /// finds its slot. Never overwrites a live slot.
    pub fn register(&self, id: CorrelationId) -> RouterResult<ReplySlot<R>> {
        let mut state = self.state.lock().recover_poison("CorrelationRegistry::register");

        if let Some(reason) = &state.closed {
            return Err(RouterError::registry_closed(reason.clone()));
        }
        if state.slots.contains_key(&id) {
            return Err(RouterError::DuplicateCorrelationId { id });
        }

        let (tx, rx) = oneshot::channel();
        state.slots.insert(
            id.clone(),
            SlotEntry {
                sender: Some(tx),
                state: SlotState::Pending,
            },
        );

        Ok(ReplySlot { id, rx })
    }

    /// Current state of the slot for `id`, or `None` if none is registered.
    pub fn lookup(&self, id: &CorrelationId) -> Option<SlotState> {
        let state = self.state.lock().recover_poison("CorrelationRegistry::lookup");
        state.slots.get(id).map(|entry| entry.state)
    }

    /// Deliver `reply` to the slot registered for `id`.
    ///
    /// A slot is settled at most once: later completions for the same id
    /// report `AlreadySettled`, and completions after removal `UnknownId`.
    pub fn complete(&self, id: &CorrelationId, reply: R) -> Completion {
        let mut state = self.state.lock().recover_poison("CorrelationRegistry::complete");

        let Some(entry) = state.slots.get_mut(id) else {
            return Completion::UnknownId;
        };
        let Some(sender) = entry.sender.take() else {
            return Completion::AlreadySettled;
        };

        match sender.send(SlotOutcome::Fulfilled(reply)) {
            Ok(()) => {
                entry.state = SlotState::Fulfilled;
                Completion::Delivered
            }
            Err(_) => {
                entry.state = SlotState::Abandoned;
                Completion::WaiterGone
            }
        }
    }

    /// Remove the slot for `id`. Idempotent.
    ///
    /// Returns `true` if a slot was removed.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        let mut state = self.state.lock().recover_poison("CorrelationRegistry::remove");
        state.slots.remove(id).is_some()
    }

    /// Settle every pending slot as `Abandoned`.
    ///
    /// Entries stay registered until their calls remove them. Returns the
    /// number of slots that were still pending.
    pub fn abandon_all(&self, reason: &str) -> usize {
        let mut state = self.state.lock().recover_poison("CorrelationRegistry::abandon_all");
        let senders: Vec<_> = state
            .slots
            .values_mut()
            .filter_map(|entry| {
                let sender = entry.sender.take()?;
                entry.state = SlotState::Abandoned;
                Some(sender)
            })
            .collect();

        // Release lock before sending
        drop(state);

        let count = senders.len();
        for sender in senders {
            let _ = sender.send(SlotOutcome::Abandoned(reason.to_string()));
        }
        count
    }

    /// Refuse further registrations and abandon everything pending.
    ///
    /// Called when the reply consumer stops for good.
    pub fn close(&self, reason: &str) -> usize {
        {
            let mut state = self.state.lock().recover_poison("CorrelationRegistry::close");
            state.closed.get_or_insert_with(|| reason.to_string());
        }
        self.abandon_all(reason)
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().recover_poison("CorrelationRegistry::is_closed");
        state.closed.is_some()
    }

    /// Number of registered slots, which equals the number of in-flight calls.
    pub fn len(&self) -> usize {
        let state = self.state.lock().recover_poison("CorrelationRegistry::len");
        state.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots still waiting for their reply.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().recover_poison("CorrelationRegistry::pending_count");
        state
            .slots
            .values()
            .filter(|entry| entry.state == SlotState::Pending)
            .count()
    }
}
