//! Reconciliation store: canonical channel and message state.
//!
//! All mutations go through [`reduce`], a total and side-effect free
//! transition over [`Action`]. [`ChatStore`] is the single writer: producers
//! running concurrently serialize through [`ChatStore::dispatch`], and the
//! presentation layer reads snapshots or watches for new ones.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{Channel, Message, MessageId, PeerAddress, Timestamp},
    error::ApiError,
    protocol::MessagePatch,
};
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingScope {
    Channels,
    Messages,
    OlderMessages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub channels: bool,
    pub messages: bool,
    pub older_messages: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    /// Sorted newest activity first.
    pub channels: Vec<Channel>,
    pub current_channel_id: Option<PeerAddress>,
    /// Per-channel timeline, chronological and unique by id. Each timeline
    /// is shared between snapshots until an action touches that channel.
    pub messages: HashMap<PeerAddress, Arc<Vec<Message>>>,
    pub unread_count: HashMap<PeerAddress, u32>,
    pub loading: LoadingFlags,
    pub last_error: Option<ApiError>,
    pub channel_errors: HashMap<PeerAddress, ApiError>,
}

impl ChatState {
    pub fn channel(&self, id: &PeerAddress) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.id == id)
    }

    pub fn messages_for(&self, id: &PeerAddress) -> &[Message] {
        self.messages.get(id).map(|list| list.as_slice()).unwrap_or_default()
    }

    pub fn unread(&self, id: &PeerAddress) -> u32 {
        self.unread_count.get(id).copied().unwrap_or(0)
    }

    pub fn channel_error(&self, id: &PeerAddress) -> Option<&ApiError> {
        self.channel_errors.get(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Replace the channel list; the caller sorts it newest first.
    SetChannels(Vec<Channel>),
    SetCurrentChannel(Option<PeerAddress>),
    /// Replace a channel's timeline; the caller sorts and dedups it. The
    /// channel's activity time is raised to the newest message.
    SetMessages {
        channel_id: PeerAddress,
        messages: Vec<Message>,
    },
    /// Fold one message that already passed the dedup ledger.
    AddMessage {
        channel_id: PeerAddress,
        message: Message,
    },
    UpdateMessage {
        channel_id: PeerAddress,
        message_id: MessageId,
        patch: MessagePatch,
    },
    CreateChannel(Channel),
    ResetUnread(PeerAddress),
    IncrementUnread(PeerAddress),
    /// Insert an older history page ahead of the loaded timeline.
    PrependMessages {
        channel_id: PeerAddress,
        messages: Vec<Message>,
    },
    /// Swap an optimistic placeholder for the transport-confirmed message.
    ConfirmMessage {
        channel_id: PeerAddress,
        placeholder_id: MessageId,
        message: Message,
    },
    SetLoading {
        scope: LoadingScope,
        loading: bool,
    },
    SetError(Option<ApiError>),
    SetChannelError {
        channel_id: PeerAddress,
        error: Option<ApiError>,
    },
    Reset,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetChannels(_) => "set_channels",
            Action::SetCurrentChannel(_) => "set_current_channel",
            Action::SetMessages { .. } => "set_messages",
            Action::AddMessage { .. } => "add_message",
            Action::UpdateMessage { .. } => "update_message",
            Action::CreateChannel(_) => "create_channel",
            Action::ResetUnread(_) => "reset_unread",
            Action::IncrementUnread(_) => "increment_unread",
            Action::PrependMessages { .. } => "prepend_messages",
            Action::ConfirmMessage { .. } => "confirm_message",
            Action::SetLoading { .. } => "set_loading",
            Action::SetError(_) => "set_error",
            Action::SetChannelError { .. } => "set_channel_error",
            Action::Reset => "reset",
        }
    }
}

/// Stable sort, newest activity first. Ties keep their previous order.
pub fn sort_channels(channels: &mut [Channel]) {
    channels.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

/// Inserts after every message with an equal or older timestamp.
fn insert_chronological(list: &mut Vec<Message>, message: Message) {
    let pos = list.partition_point(|m| m.timestamp <= message.timestamp);
    list.insert(pos, message);
}

fn bump_last_message_at(channels: &mut [Channel], channel_id: &PeerAddress, timestamp: Timestamp) {
    if let Some(channel) = channels.iter_mut().find(|c| &c.id == channel_id) {
        channel.last_message_at = channel.last_message_at.max(timestamp);
    }
    sort_channels(channels);
}

pub fn reduce(state: &mut ChatState, action: Action) {
    match action {
        Action::SetChannels(channels) => {
            let mut seen = HashSet::new();
            state.channels = channels
                .into_iter()
                .filter(|c| seen.insert(c.id.clone()))
                .collect();
        }
        Action::SetCurrentChannel(channel_id) => {
            state.current_channel_id = channel_id;
        }
        Action::SetMessages {
            channel_id,
            messages,
        } => {
            let newest = messages.last().map(|m| m.timestamp);
            state.messages.insert(channel_id.clone(), Arc::new(messages));
            if let Some(timestamp) = newest {
                bump_last_message_at(&mut state.channels, &channel_id, timestamp);
            }
        }
        Action::AddMessage {
            channel_id,
            message,
        } => {
            let list = state.messages.entry(channel_id.clone()).or_default();
            if list.iter().any(|m| m.id == message.id) {
                return;
            }
            let timestamp = message.timestamp;
            insert_chronological(Arc::make_mut(list), message);
            bump_last_message_at(&mut state.channels, &channel_id, timestamp);
        }
        Action::UpdateMessage {
            channel_id,
            message_id,
            patch,
        } => {
            let Some(list) = state.messages.get_mut(&channel_id) else {
                return;
            };
            if let Some(pos) = list.iter().position(|m| m.id == message_id) {
                patch.apply_to(&mut Arc::make_mut(list)[pos]);
            }
        }
        Action::CreateChannel(channel) => {
            if state.channels.iter().any(|c| c.id == channel.id) {
                return;
            }
            state.channels.push(channel);
            sort_channels(&mut state.channels);
        }
        Action::ResetUnread(channel_id) => {
            state.unread_count.insert(channel_id, 0);
        }
        Action::IncrementUnread(channel_id) => {
            let count = state.unread_count.entry(channel_id).or_insert(0);
            *count = count.saturating_add(1);
        }
        Action::PrependMessages {
            channel_id,
            messages,
        } => {
            let list = state.messages.entry(channel_id).or_default();
            let mut known: HashSet<MessageId> = list.iter().map(|m| m.id.clone()).collect();
            let mut merged: Vec<Message> = messages
                .into_iter()
                .filter(|m| known.insert(m.id.clone()))
                .collect();
            if merged.is_empty() {
                return;
            }
            merged.extend(list.iter().cloned());
            if merged.windows(2).any(|w| w[0].timestamp > w[1].timestamp) {
                merged.sort_by_key(|m| m.timestamp);
            }
            *list = Arc::new(merged);
        }
        Action::ConfirmMessage {
            channel_id,
            placeholder_id,
            message,
        } => {
            let list = Arc::make_mut(state.messages.entry(channel_id.clone()).or_default());
            list.retain(|m| m.id != placeholder_id);
            if list.iter().any(|m| m.id == message.id) {
                return;
            }
            let timestamp = message.timestamp;
            insert_chronological(list, message);
            bump_last_message_at(&mut state.channels, &channel_id, timestamp);
        }
        Action::SetLoading { scope, loading } => match scope {
            LoadingScope::Channels => state.loading.channels = loading,
            LoadingScope::Messages => state.loading.messages = loading,
            LoadingScope::OlderMessages => state.loading.older_messages = loading,
        },
        Action::SetError(error) => {
            state.last_error = error;
        }
        Action::SetChannelError { channel_id, error } => match error {
            Some(error) => {
                state.channel_errors.insert(channel_id, error);
            }
            None => {
                state.channel_errors.remove(&channel_id);
            }
        },
        Action::Reset => {
            *state = ChatState::default();
        }
    }
}

pub struct ChatStore {
    state: Mutex<Arc<ChatState>>,
    updates: watch::Sender<Arc<ChatState>>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        let initial = Arc::new(ChatState::default());
        let (updates, _) = watch::channel(Arc::clone(&initial));
        Self {
            state: Mutex::new(initial),
            updates,
        }
    }

    fn guard(&self) -> MutexGuard<'_, Arc<ChatState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch(&self, action: Action) {
        self.dispatch_with(|_| Some(action));
    }

    /// Builds an action from the current state and applies it under the same
    /// lock, so no other producer can interleave between read and write.
    /// Returns whether an action was applied.
    pub fn dispatch_with<F>(&self, build: F) -> bool
    where
        F: FnOnce(&ChatState) -> Option<Action>,
    {
        let mut guard = self.guard();
        let Some(action) = build(&guard) else {
            return false;
        };
        trace!(action = action.name(), "store: apply");
        reduce(Arc::make_mut(&mut guard), action);
        self.updates.send_replace(Arc::clone(&guard));
        true
    }

    pub fn snapshot(&self) -> Arc<ChatState> {
        Arc::clone(&self.guard())
    }

    /// Receives a fresh snapshot after every applied action.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
