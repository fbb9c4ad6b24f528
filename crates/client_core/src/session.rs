//! Session orchestrator: binds an identity and a messaging client to the
//! reconciliation store and drives the three producers (bulk listing, live
//! subscription, backward pagination) through the dedup ledger.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{Channel, Message, MessageId, MessageStatus, PeerAddress},
    protocol::{MessagePatch, RawMessage},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    error::{Result, SyncError},
    ledger::DedupLedger,
    markers::MarkerStore,
    pager::HistoryPager,
    store::{sort_channels, Action, ChatState, ChatStore, LoadingScope},
    stream_manager::{StreamManager, StreamSink, StreamState},
    transport::{IdentityProvider, MessagingClient},
};

#[derive(Clone)]
struct Binding {
    client: Arc<dyn MessagingClient>,
    local: PeerAddress,
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionInner {
    identity: Arc<dyn IdentityProvider>,
    store: ChatStore,
    ledger: Mutex<Arc<DedupLedger>>,
    pager: HistoryPager,
    stream: StreamManager,
    markers: Option<Arc<MarkerStore>>,
    binding: Mutex<Option<Binding>>,
    /// Address the current state belongs to; survives disconnects.
    state_owner: Mutex<Option<PeerAddress>>,
    generations: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionInner {
    fn ledger(&self) -> Arc<DedupLedger> {
        Arc::clone(&lock(&self.ledger))
    }

    fn binding(&self) -> Option<Binding> {
        lock(&self.binding).clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.binding)
            .as_ref()
            .is_some_and(|b| b.generation == generation)
    }

    fn is_blocked(&self, address: &PeerAddress) -> bool {
        self.markers.as_ref().is_some_and(|m| m.is_blocked(address))
    }

    fn is_muted(&self, channel: &PeerAddress) -> bool {
        self.markers.as_ref().is_some_and(|m| m.is_muted(channel))
    }

    fn fold_live(&self, generation: u64, raw: RawMessage) {
        let Some(binding) = self.binding().filter(|b| b.generation == generation) else {
            debug!(generation, id = %raw.id, "session: dropping event from a stale client");
            return;
        };
        if self.is_blocked(&raw.sender_address) {
            debug!(sender = %raw.sender_address, "session: dropping event from blocked sender");
            return;
        }
        let ledger = self.ledger();
        if !ledger.mark_message(&raw.id) {
            debug!(id = %raw.id, "session: duplicate suppressed");
            return;
        }

        let local = binding.local;
        let channel_id = raw.channel_for(&local);
        let own = raw.sender_address == local;
        let mut message = raw.into_message();
        if own {
            message.status = Some(MessageStatus::Sent);
        }
        if ledger.mark_channel(&channel_id) {
            info!(channel = %channel_id, "session: new conversation from live stream");
        }

        self.store.dispatch(Action::CreateChannel(Channel::direct(
            &local,
            &channel_id,
            message.timestamp,
        )));
        if own {
            // The echo can beat the send acknowledgement; settle the oldest
            // matching placeholder so the message shows once.
            self.store.dispatch_with(|state| {
                let placeholder = state.messages_for(&channel_id).iter().find(|m| {
                    m.status == Some(MessageStatus::Sending)
                        && m.sender == local
                        && m.content == message.content
                });
                Some(match placeholder {
                    Some(placeholder) => Action::ConfirmMessage {
                        channel_id: channel_id.clone(),
                        placeholder_id: placeholder.id.clone(),
                        message,
                    },
                    None => Action::AddMessage {
                        channel_id: channel_id.clone(),
                        message,
                    },
                })
            });
        } else {
            self.store.dispatch(Action::AddMessage {
                channel_id: channel_id.clone(),
                message,
            });
        }
        let muted = self.is_muted(&channel_id);
        self.store.dispatch_with(|state| {
            let current = state.current_channel_id.as_ref() == Some(&channel_id);
            (!own && !current && !muted).then(|| Action::IncrementUnread(channel_id.clone()))
        });
    }

    fn stream_failed(&self, generation: u64, error: &SyncError) {
        if !self.is_current(generation) {
            return;
        }
        warn!(generation, %error, "session: live stream failed, reconnect to resume");
        self.store
            .dispatch(Action::SetError(Some(error.to_api_error())));
    }

    fn record_error(&self, error: &SyncError) {
        self.store
            .dispatch(Action::SetError(Some(error.to_api_error())));
    }

    fn record_channel_error(&self, channel_id: &PeerAddress, error: Option<&SyncError>) {
        self.store.dispatch(Action::SetChannelError {
            channel_id: channel_id.clone(),
            error: error.map(SyncError::to_api_error),
        });
    }
}

/// Folds live events for one client generation.
struct LiveFold {
    session: Weak<SessionInner>,
    generation: u64,
}

impl StreamSink for LiveFold {
    fn on_message(&self, raw: RawMessage) {
        if let Some(session) = self.session.upgrade() {
            session.fold_live(self.generation, raw);
        }
    }

    fn on_failure(&self, error: &SyncError) {
        if let Some(session) = self.session.upgrade() {
            session.stream_failed(self.generation, error);
        }
    }
}

fn history_message(raw: RawMessage) -> Message {
    raw.into_message().with_status(MessageStatus::Sent)
}

pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(identity: Arc<dyn IdentityProvider>, settings: &Settings) -> Self {
        Self::from_parts(identity, settings, Arc::new(DedupLedger::new()), None)
    }

    pub fn from_parts(
        identity: Arc<dyn IdentityProvider>,
        settings: &Settings,
        ledger: Arc<DedupLedger>,
        markers: Option<Arc<MarkerStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                identity,
                store: ChatStore::new(),
                ledger: Mutex::new(ledger),
                pager: HistoryPager::new(settings.history_page_size, settings.fallback_history_limit),
                stream: StreamManager::new(settings.event_queue_capacity, settings.stop_timeout()),
                markers,
                binding: Mutex::new(None),
                state_owner: Mutex::new(None),
                generations: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> Arc<ChatState> {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
        self.inner.store.subscribe()
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.stream.state()
    }

    pub fn watch_stream_state(&self) -> watch::Receiver<StreamState> {
        self.inner.stream.watch_state()
    }

    pub fn ledger(&self) -> Arc<DedupLedger> {
        self.inner.ledger()
    }

    pub fn markers(&self) -> Option<&Arc<MarkerStore>> {
        self.inner.markers.as_ref()
    }

    pub fn local_address(&self) -> Option<PeerAddress> {
        self.inner.binding().map(|b| b.local)
    }

    fn bound(&self) -> Result<Binding> {
        self.inner.binding().ok_or(SyncError::NoClient)
    }

    /// Binds `client` as a new generation, replaces the live subscription and
    /// loads the conversation list. Events still in flight from an earlier
    /// client are dropped.
    pub async fn connect(&self, client: Arc<dyn MessagingClient>) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let local = match self.inner.identity.current_address() {
            Some(address) if self.inner.identity.is_ready() => address,
            _ => {
                let err = SyncError::IdentityUnavailable;
                self.inner.record_error(&err);
                return Err(err);
            }
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.binding) = Some(Binding {
            client: Arc::clone(&client),
            local: local.clone(),
            generation,
        });

        let previous_owner = lock(&self.inner.state_owner).replace(local.clone());
        if previous_owner.is_some_and(|owner| owner != local) {
            info!(%local, "session: identity changed, resetting state");
            self.inner.pager.discard();
            *lock(&self.inner.ledger) = Arc::new(DedupLedger::new());
            self.inner.store.dispatch(Action::Reset);
        }
        info!(generation, %local, "session: client bound");

        let sink = Arc::new(LiveFold {
            session: Arc::downgrade(&self.inner),
            generation,
        });
        if let Err(err) = self
            .inner
            .stream
            .replace(client.as_ref(), generation, sink)
            .await
        {
            self.inner.record_error(&err);
            return Err(err);
        }

        self.load_conversations().await
    }

    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stream.stop().await;
        self.inner.pager.discard();
        if let Some(previous) = lock(&self.inner.binding).take() {
            info!(generation = previous.generation, "session: client unbound");
        }
    }

    /// Lists every conversation, fetching each one's latest message
    /// concurrently, and merges the result with channels the live stream
    /// created in the meantime.
    pub async fn load_conversations(&self) -> Result<()> {
        let binding = self.bound()?;
        let store = &self.inner.store;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::Channels,
            loading: true,
        });
        let listed = self.list_channels(&binding).await;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::Channels,
            loading: false,
        });

        let listed = match listed {
            Ok(listed) => listed,
            Err(err) => {
                warn!(error = %err, "session: conversation listing failed");
                self.inner.record_error(&err);
                return Err(err);
            }
        };
        if !self.inner.is_current(binding.generation) {
            debug!(generation = binding.generation, "session: dropping listing from a stale client");
            return Ok(());
        }

        let ledger = self.inner.ledger();
        for channel in &listed {
            ledger.mark_channel(&channel.id);
        }
        let count = listed.len();
        store.dispatch_with(|state| {
            let mut merged = listed;
            let listed_ids: HashSet<PeerAddress> = merged.iter().map(|c| c.id.clone()).collect();
            for channel in &mut merged {
                if let Some(existing) = state.channel(&channel.id) {
                    channel.last_message_at = channel.last_message_at.max(existing.last_message_at);
                }
            }
            merged.extend(
                state
                    .channels
                    .iter()
                    .filter(|c| !listed_ids.contains(&c.id))
                    .cloned(),
            );
            sort_channels(&mut merged);
            Some(Action::SetChannels(merged))
        });
        store.dispatch(Action::SetError(None));
        info!(conversations = count, "session: conversations loaded");
        Ok(())
    }

    async fn list_channels(&self, binding: &Binding) -> Result<Vec<Channel>> {
        let conversations = binding
            .client
            .list_conversations()
            .await
            .map_err(SyncError::Transport)?;
        let conversations: Vec<_> = conversations
            .into_iter()
            .filter(|c| !self.inner.is_blocked(c.peer_address()))
            .collect();

        let latest = join_all(conversations.iter().map(|conversation| async move {
            (conversation.peer_address().clone(), conversation.latest_message().await)
        }))
        .await;

        Ok(latest
            .into_iter()
            .map(|(peer, latest)| {
                let last_message_at = match latest {
                    Ok(Some(message)) => message.timestamp(),
                    Ok(None) => 0,
                    Err(err) => {
                        warn!(%peer, error = %format!("{err:#}"), "session: latest message unavailable");
                        0
                    }
                };
                Channel::direct(&binding.local, &peer, last_message_at)
            })
            .collect())
    }

    /// Selects the channel the user is looking at. Switching channels drops
    /// the open history cursor.
    pub async fn set_current_channel(&self, channel_id: Option<PeerAddress>) -> Result<()> {
        let previous = self.inner.store.snapshot().current_channel_id.clone();
        if previous != channel_id {
            self.inner.pager.discard();
        }
        self.inner
            .store
            .dispatch(Action::SetCurrentChannel(channel_id.clone()));
        match channel_id {
            Some(channel_id) => {
                self.inner
                    .store
                    .dispatch(Action::ResetUnread(channel_id.clone()));
                self.fetch_messages(&channel_id).await
            }
            None => Ok(()),
        }
    }

    /// Loads the newest history page for `channel_id` and merges it with any
    /// messages the live stream already folded.
    pub async fn fetch_messages(&self, channel_id: &PeerAddress) -> Result<()> {
        let binding = self.bound()?;
        let result = self.fetch_messages_for(&binding, channel_id).await;
        match &result {
            Ok(()) => self.inner.record_channel_error(channel_id, None),
            Err(SyncError::NoActiveCursor) => {
                debug!(channel = %channel_id, "session: history fetch superseded by a channel switch");
                return Ok(());
            }
            Err(err) => {
                warn!(channel = %channel_id, error = %err, "session: history fetch failed");
                self.inner.record_channel_error(channel_id, Some(err));
            }
        }
        result
    }

    async fn fetch_messages_for(&self, binding: &Binding, channel_id: &PeerAddress) -> Result<()> {
        if channel_id == &binding.local {
            return Err(SyncError::SelfConversation);
        }
        let store = &self.inner.store;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::Messages,
            loading: true,
        });
        let page = async {
            if !binding
                .client
                .can_message(channel_id)
                .await
                .map_err(SyncError::Transport)?
            {
                return Err(SyncError::NotMessageable(channel_id.clone()));
            }
            let conversation = binding
                .client
                .open_conversation(channel_id)
                .await
                .map_err(SyncError::Transport)?;
            self.inner
                .pager
                .open_initial_page(channel_id, conversation.as_ref())
                .await
        }
        .await;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::Messages,
            loading: false,
        });
        let page = page?;

        if !self.inner.is_current(binding.generation) {
            debug!(channel = %channel_id, "session: dropping history from a stale client");
            return Ok(());
        }

        let ledger = self.inner.ledger();
        ledger.mark_channel(channel_id);
        let fetched: Vec<Message> = page
            .messages
            .into_iter()
            .map(|raw| {
                ledger.mark_message(&raw.id);
                history_message(raw)
            })
            .collect();
        let newest = fetched.last().map(|m| m.timestamp).unwrap_or(0);
        debug!(channel = %channel_id, messages = fetched.len(), has_more = page.has_more, "session: history page folded");

        store.dispatch(Action::CreateChannel(Channel::direct(
            &binding.local,
            channel_id,
            newest,
        )));
        store.dispatch_with(|state| {
            let mut merged = fetched;
            let known: HashSet<MessageId> = merged.iter().map(|m| m.id.clone()).collect();
            merged.extend(
                state
                    .messages_for(channel_id)
                    .iter()
                    .filter(|m| !known.contains(&m.id))
                    .cloned(),
            );
            merged.sort_by_key(|m| m.timestamp);
            Some(Action::SetMessages {
                channel_id: channel_id.clone(),
                messages: merged,
            })
        });
        Ok(())
    }

    /// Prepends the next older page of the current channel. Returns how many
    /// messages were added; zero once history is exhausted.
    pub async fn load_older_messages(&self) -> Result<usize> {
        let channel_id = self
            .inner
            .store
            .snapshot()
            .current_channel_id
            .clone()
            .ok_or(SyncError::NoActiveCursor)?;
        let store = &self.inner.store;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::OlderMessages,
            loading: true,
        });
        let page = self.inner.pager.load_older_page(&channel_id).await;
        store.dispatch(Action::SetLoading {
            scope: LoadingScope::OlderMessages,
            loading: false,
        });
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                if matches!(err, SyncError::Transport(_)) {
                    self.inner.record_channel_error(&channel_id, Some(&err));
                }
                return Err(err);
            }
        };

        let ledger = self.inner.ledger();
        let older: Vec<Message> = page
            .messages
            .into_iter()
            .map(|raw| {
                ledger.mark_message(&raw.id);
                history_message(raw)
            })
            .collect();
        let count = older.len();
        if count > 0 {
            store.dispatch(Action::PrependMessages {
                channel_id: channel_id.clone(),
                messages: older,
            });
        }
        debug!(channel = %channel_id, messages = count, has_more = page.has_more, "session: older page folded");
        Ok(count)
    }

    /// Starts a conversation with `raw_address` after validating it and
    /// checking the peer is reachable.
    pub async fn create_channel(&self, raw_address: &str) -> Result<PeerAddress> {
        let result = self.create_channel_inner(raw_address).await;
        if let Err(err) = &result {
            warn!(address = raw_address, error = %err, "session: channel creation failed");
            self.inner.record_error(err);
        }
        result
    }

    async fn create_channel_inner(&self, raw_address: &str) -> Result<PeerAddress> {
        let binding = self.bound()?;
        let peer = PeerAddress::parse(raw_address)?;
        if peer == binding.local {
            return Err(SyncError::SelfConversation);
        }
        if !binding
            .client
            .can_message(&peer)
            .await
            .map_err(SyncError::Transport)?
        {
            return Err(SyncError::NotMessageable(peer));
        }
        let conversation = binding
            .client
            .open_conversation(&peer)
            .await
            .map_err(SyncError::Transport)?;
        let last_message_at = match conversation.latest_message().await {
            Ok(latest) => latest.map(|m| m.timestamp()).unwrap_or(0),
            Err(err) => {
                warn!(%peer, error = %format!("{err:#}"), "session: latest message unavailable");
                0
            }
        };

        self.inner.ledger().mark_channel(&peer);
        self.inner.store.dispatch(Action::CreateChannel(Channel::direct(
            &binding.local,
            &peer,
            last_message_at,
        )));
        info!(%peer, "session: channel created");
        Ok(peer)
    }

    /// Sends `content` to `channel_id`. The message shows up immediately as a
    /// `Sending` placeholder that is swapped for the confirmed message, or
    /// marked `Failed` when the network rejects it.
    pub async fn send_message(&self, channel_id: &PeerAddress, content: &str) -> Result<MessageId> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let binding = self.bound()?;
        if channel_id == &binding.local {
            return Err(SyncError::SelfConversation);
        }

        let store = &self.inner.store;
        let placeholder_id = MessageId(format!("local-{}", Uuid::new_v4()));
        let placeholder = Message::new(
            placeholder_id.clone(),
            binding.local.clone(),
            content,
            Utc::now().timestamp_millis(),
        )
        .with_status(MessageStatus::Sending);
        store.dispatch(Action::CreateChannel(Channel::direct(
            &binding.local,
            channel_id,
            placeholder.timestamp,
        )));
        store.dispatch(Action::AddMessage {
            channel_id: channel_id.clone(),
            message: placeholder,
        });

        let sent = async {
            let conversation = binding
                .client
                .open_conversation(channel_id)
                .await
                .map_err(|err| SyncError::SendFailed(format!("{err:#}")))?;
            conversation
                .send(content)
                .await
                .map_err(|err| SyncError::SendFailed(format!("{err:#}")))
        }
        .await;

        match sent {
            Ok(raw) => {
                let id = raw.id.clone();
                self.inner.ledger().mark_message(&id);
                store.dispatch(Action::ConfirmMessage {
                    channel_id: channel_id.clone(),
                    placeholder_id,
                    message: history_message(raw),
                });
                self.inner.record_channel_error(channel_id, None);
                debug!(channel = %channel_id, %id, "session: message confirmed");
                Ok(id)
            }
            Err(err) => {
                warn!(channel = %channel_id, error = %err, "session: send failed");
                store.dispatch(Action::UpdateMessage {
                    channel_id: channel_id.clone(),
                    message_id: placeholder_id,
                    patch: MessagePatch::status(MessageStatus::Failed),
                });
                self.inner.record_channel_error(channel_id, Some(&err));
                Err(err)
            }
        }
    }

    pub fn add_reaction(&self, channel_id: &PeerAddress, message_id: &MessageId, emoji: &str) -> Result<()> {
        let binding = self.bound()?;
        self.patch_message(channel_id, message_id, MessagePatch::reaction(emoji, binding.local));
        Ok(())
    }

    pub fn edit_message(&self, channel_id: &PeerAddress, message_id: &MessageId, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.patch_message(channel_id, message_id, MessagePatch::edit(content));
        Ok(())
    }

    /// Soft delete: the message stays in the timeline without content.
    pub fn delete_message(&self, channel_id: &PeerAddress, message_id: &MessageId) {
        self.patch_message(channel_id, message_id, MessagePatch::delete());
    }

    pub fn mark_message_read(&self, channel_id: &PeerAddress, message_id: &MessageId) {
        self.patch_message(channel_id, message_id, MessagePatch::status(MessageStatus::Read));
    }

    fn patch_message(&self, channel_id: &PeerAddress, message_id: &MessageId, patch: MessagePatch) {
        self.inner.store.dispatch(Action::UpdateMessage {
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
            patch,
        });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
