use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use shared::domain::{MessageId, PeerAddress};

/// Session-scoped record of every message and channel id already folded.
///
/// Shared by the listing, live and pagination producers. Marking is a single
/// check-and-insert under one lock, so two producers racing on the same id
/// cannot both win. Entries are never removed for the life of the session.
#[derive(Debug, Default)]
pub struct DedupLedger {
    inner: Mutex<LedgerSets>,
}

#[derive(Debug, Default)]
struct LedgerSets {
    messages: HashSet<MessageId>,
    channels: HashSet<PeerAddress>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, LedgerSets> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when `id` was not seen before and is now marked.
    pub fn mark_message(&self, id: &MessageId) -> bool {
        self.sets().messages.insert(id.clone())
    }

    /// Returns `true` when `id` was not seen before and is now marked.
    pub fn mark_channel(&self, id: &PeerAddress) -> bool {
        self.sets().channels.insert(id.clone())
    }

    pub fn has_seen_message(&self, id: &MessageId) -> bool {
        self.sets().messages.contains(id)
    }

    pub fn has_seen_channel(&self, id: &PeerAddress) -> bool {
        self.sets().channels.contains(id)
    }

    pub fn seen_message_count(&self) -> usize {
        self.sets().messages.len()
    }

    pub fn seen_channel_count(&self) -> usize {
        self.sets().channels.len()
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
