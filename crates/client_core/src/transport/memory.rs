//! In-process messaging network.
//!
//! Implements the transport traits over shared memory so sessions can be
//! exercised end to end without a real network. Supports paged and unpaged
//! history, duplicate redelivery and failure injection.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, PeerAddress},
    protocol::RawMessage,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use uuid::Uuid;

use super::{Conversation, EventSource, MessagingClient, Page, PageCursor};

type Delivery = std::result::Result<RawMessage, String>;
type PairKey = (PeerAddress, PeerAddress);

fn pair_key(a: &PeerAddress, b: &PeerAddress) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Rewrites the conversation peer to the party `viewer` is talking to.
fn view_for(raw: &RawMessage, viewer: &PeerAddress) -> RawMessage {
    let mut view = raw.clone();
    view.conversation_peer_address = if &raw.sender_address == viewer {
        raw.conversation_peer_address.clone()
    } else {
        raw.sender_address.clone()
    };
    view
}

#[derive(Default)]
struct NetworkState {
    registered: HashSet<PeerAddress>,
    conversations: HashMap<PairKey, Vec<RawMessage>>,
    subscribers: HashMap<PeerAddress, Vec<mpsc::UnboundedSender<Delivery>>>,
    fail_next_subscribe: Option<String>,
    send_failure: Option<String>,
    listing_failure: Option<String>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
    open_conversation_calls: AtomicUsize,
    can_message_calls: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, address: &PeerAddress) {
        self.state().registered.insert(address.clone());
    }

    /// Client bound to `local`, with paged history support.
    pub fn client(self: &Arc<Self>, local: PeerAddress) -> MemoryClient {
        self.register(&local);
        MemoryClient {
            network: Arc::clone(self),
            local,
            paging: true,
        }
    }

    /// Stores a message and pushes it to live subscribers of both parties.
    pub fn post_at(
        &self,
        from: &PeerAddress,
        to: &PeerAddress,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> RawMessage {
        let raw = RawMessage {
            id: MessageId(Uuid::new_v4().to_string()),
            sender_address: from.clone(),
            content: content.into(),
            sent_at,
            conversation_peer_address: to.clone(),
        };
        self.state()
            .conversations
            .entry(pair_key(from, to))
            .or_default()
            .push(raw.clone());
        self.fan_out(&raw);
        raw
    }

    pub fn post(&self, from: &PeerAddress, to: &PeerAddress, content: impl Into<String>) -> RawMessage {
        self.post_at(from, to, content, Utc::now())
    }

    /// Delivers an already stored message to live subscribers again.
    pub fn redeliver(&self, raw: &RawMessage) {
        self.fan_out(raw);
    }

    fn fan_out(&self, raw: &RawMessage) {
        let mut state = self.state();
        let mut recipients = vec![raw.sender_address.clone()];
        if raw.conversation_peer_address != raw.sender_address {
            recipients.push(raw.conversation_peer_address.clone());
        }
        for recipient in recipients {
            if let Some(senders) = state.subscribers.get_mut(&recipient) {
                let view = view_for(raw, &recipient);
                senders.retain(|tx| tx.send(Ok(view.clone())).is_ok());
            }
        }
    }

    /// Pushes a receive error into every open subscription.
    pub fn break_streams(&self, reason: &str) {
        let mut state = self.state();
        for senders in state.subscribers.values_mut() {
            senders.retain(|tx| tx.send(Err(reason.to_string())).is_ok());
        }
    }

    /// Ends every open subscription as if the network hung up.
    pub fn hang_up_streams(&self) {
        self.state().subscribers.clear();
    }

    pub fn fail_next_subscribe(&self, reason: &str) {
        self.state().fail_next_subscribe = Some(reason.to_string());
    }

    pub fn set_send_failure(&self, reason: Option<&str>) {
        self.state().send_failure = reason.map(str::to_string);
    }

    pub fn set_listing_failure(&self, reason: Option<&str>) {
        self.state().listing_failure = reason.map(str::to_string);
    }

    pub fn subscriber_count(&self, address: &PeerAddress) -> usize {
        self.state()
            .subscribers
            .get(address)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn open_conversation_calls(&self) -> usize {
        self.open_conversation_calls.load(Ordering::SeqCst)
    }

    pub fn can_message_calls(&self) -> usize {
        self.can_message_calls.load(Ordering::SeqCst)
    }

    /// Messages between `a` and `b`, newest first.
    fn history(&self, a: &PeerAddress, b: &PeerAddress) -> Vec<RawMessage> {
        let mut messages = self
            .state()
            .conversations
            .get(&pair_key(a, b))
            .cloned()
            .unwrap_or_default();
        messages.sort_by(|x, y| y.sent_at.cmp(&x.sent_at));
        messages
    }
}

#[derive(Clone)]
pub struct MemoryClient {
    network: Arc<MemoryNetwork>,
    local: PeerAddress,
    paging: bool,
}

impl MemoryClient {
    /// Same client without paged history, forcing the bounded fallback.
    pub fn without_paging(mut self) -> Self {
        self.paging = false;
        self
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn conversation(&self, peer: &PeerAddress) -> Arc<dyn Conversation> {
        Arc::new(MemoryConversation {
            network: Arc::clone(&self.network),
            local: self.local.clone(),
            peer: peer.clone(),
            paging: self.paging,
        })
    }
}

#[async_trait]
impl MessagingClient for MemoryClient {
    async fn can_message(&self, peer: &PeerAddress) -> Result<bool> {
        self.network.can_message_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.network.state().registered.contains(peer))
    }

    async fn list_conversations(&self) -> Result<Vec<Arc<dyn Conversation>>> {
        let peers: Vec<PeerAddress> = {
            let state = self.network.state();
            if let Some(reason) = &state.listing_failure {
                return Err(anyhow!("listing conversations failed: {reason}"));
            }
            state
                .conversations
                .keys()
                .filter_map(|(a, b)| {
                    if a == &self.local {
                        Some(b.clone())
                    } else if b == &self.local {
                        Some(a.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        Ok(peers.iter().map(|peer| self.conversation(peer)).collect())
    }

    async fn open_conversation(&self, peer: &PeerAddress) -> Result<Arc<dyn Conversation>> {
        self.network
            .open_conversation_calls
            .fetch_add(1, Ordering::SeqCst);
        if !self.network.state().registered.contains(peer) {
            return Err(anyhow!("{peer} has no messaging identity"));
        }
        Ok(self.conversation(peer))
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSource>> {
        let mut state = self.network.state();
        if let Some(reason) = state.fail_next_subscribe.take() {
            return Err(anyhow!("subscription refused: {reason}"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(self.local.clone())
            .or_default()
            .push(tx);
        Ok(Box::new(MemoryEventSource {
            events: UnboundedReceiverStream::new(rx),
            closed: false,
        }))
    }
}

struct MemoryConversation {
    network: Arc<MemoryNetwork>,
    local: PeerAddress,
    peer: PeerAddress,
    paging: bool,
}

#[async_trait]
impl Conversation for MemoryConversation {
    fn peer_address(&self) -> &PeerAddress {
        &self.peer
    }

    async fn fetch_history(&self, limit: usize) -> Result<Vec<RawMessage>> {
        Ok(self
            .network
            .history(&self.local, &self.peer)
            .into_iter()
            .take(limit)
            .map(|raw| view_for(&raw, &self.local))
            .collect())
    }

    async fn fetch_history_paged(&self, page_size: usize) -> Result<Option<Box<dyn PageCursor>>> {
        if !self.paging {
            return Ok(None);
        }
        let snapshot = self
            .network
            .history(&self.local, &self.peer)
            .into_iter()
            .map(|raw| view_for(&raw, &self.local))
            .collect();
        Ok(Some(Box::new(MemoryPageCursor {
            snapshot,
            offset: 0,
            page_size: page_size.max(1),
        })))
    }

    async fn send(&self, content: &str) -> Result<RawMessage> {
        if let Some(reason) = self.network.state().send_failure.clone() {
            return Err(anyhow!("send rejected: {reason}"));
        }
        let raw = self.network.post(&self.local, &self.peer, content);
        Ok(view_for(&raw, &self.local))
    }
}

struct MemoryPageCursor {
    snapshot: Vec<RawMessage>,
    offset: usize,
    page_size: usize,
}

#[async_trait]
impl PageCursor for MemoryPageCursor {
    async fn next_page(&mut self) -> Result<Page> {
        let end = (self.offset + self.page_size).min(self.snapshot.len());
        let messages = self.snapshot[self.offset..end].to_vec();
        self.offset = end;
        Ok(Page {
            messages,
            done: self.offset >= self.snapshot.len(),
        })
    }
}

struct MemoryEventSource {
    events: UnboundedReceiverStream<Delivery>,
    closed: bool,
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn next_event(&mut self) -> Option<Result<RawMessage>> {
        if self.closed {
            return None;
        }
        self.events
            .next()
            .await
            .map(|delivery| delivery.map_err(|reason| anyhow!("stream receive failed: {reason}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.events.close();
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/memory_transport_tests.rs"]
mod tests;
