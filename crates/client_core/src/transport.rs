//! Seams to the external identity provider and messaging network.
//!
//! The engine never talks to a network directly; it drives these traits.
//! Implementations return `anyhow::Result` and the engine classifies failures
//! into [`crate::error::SyncError`] at the boundary where they occur.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::PeerAddress, protocol::RawMessage};

pub mod memory;

pub trait IdentityProvider: Send + Sync {
    fn current_address(&self) -> Option<PeerAddress>;
    fn is_ready(&self) -> bool;
}

/// Identity that is known up front, e.g. from a loaded wallet.
pub struct StaticIdentity {
    address: Option<PeerAddress>,
}

impl StaticIdentity {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address: Some(address),
        }
    }

    pub fn unavailable() -> Self {
        Self { address: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_address(&self) -> Option<PeerAddress> {
        self.address.clone()
    }

    fn is_ready(&self) -> bool {
        self.address.is_some()
    }
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn can_message(&self, peer: &PeerAddress) -> Result<bool>;
    async fn list_conversations(&self) -> Result<Vec<Arc<dyn Conversation>>>;
    /// Returns the conversation with `peer`, creating it when needed.
    async fn open_conversation(&self, peer: &PeerAddress) -> Result<Arc<dyn Conversation>>;
    /// Live feed of new messages across all conversations of the local user.
    async fn subscribe(&self) -> Result<Box<dyn EventSource>>;
}

#[async_trait]
pub trait Conversation: Send + Sync {
    fn peer_address(&self) -> &PeerAddress;

    /// Up to `limit` messages, in no guaranteed order.
    async fn fetch_history(&self, limit: usize) -> Result<Vec<RawMessage>>;

    async fn latest_message(&self) -> Result<Option<RawMessage>> {
        let messages = self.fetch_history(1).await?;
        Ok(messages.into_iter().max_by_key(|m| m.sent_at))
    }

    /// Newest-first paged history. `None` means the transport has no paging
    /// support and callers should use [`Conversation::fetch_history`].
    async fn fetch_history_paged(&self, _page_size: usize) -> Result<Option<Box<dyn PageCursor>>> {
        Ok(None)
    }

    async fn send(&self, content: &str) -> Result<RawMessage>;
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Newest message first.
    pub messages: Vec<RawMessage>,
    pub done: bool,
}

#[async_trait]
pub trait PageCursor: Send {
    async fn next_page(&mut self) -> Result<Page>;
}

#[async_trait]
pub trait EventSource: Send {
    /// Waits for the next inbound message. `None` once the feed has ended.
    async fn next_event(&mut self) -> Option<Result<RawMessage>>;
    async fn close(&mut self) -> Result<()>;
}
