//! Durable per-user markers: blocked peers, pinned messages, muted channels.
//!
//! Each marker kind is one JSON blob in [`storage::Storage`]. Blobs are read
//! once when the store opens and cached; every mutation writes its blob
//! before the cache changes.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::de::DeserializeOwned;
use shared::domain::{Message, PeerAddress};
use storage::Storage;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

pub const BLOCKED_ADDRESSES_KEY: &str = "blockedAddresses";
pub const PINNED_MESSAGES_KEY: &str = "pinnedMessages";
pub const MUTED_CHANNELS_KEY: &str = "mutedChannels";

#[derive(Debug, Clone, Default)]
struct Markers {
    blocked: BTreeSet<PeerAddress>,
    pinned: BTreeMap<PeerAddress, Message>,
    muted: BTreeSet<PeerAddress>,
}

pub struct MarkerStore {
    storage: Storage,
    cache: Mutex<Markers>,
    writes: tokio::sync::Mutex<()>,
}

impl MarkerStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let storage = Storage::new(database_url)
            .await
            .map_err(SyncError::Storage)?;
        Ok(Self::open(storage).await)
    }

    /// Loads every marker blob. A blob that is missing or unreadable starts
    /// out empty.
    pub async fn open(storage: Storage) -> Self {
        let markers = Markers {
            blocked: load_or_default(&storage, BLOCKED_ADDRESSES_KEY).await,
            pinned: load_or_default(&storage, PINNED_MESSAGES_KEY).await,
            muted: load_or_default(&storage, MUTED_CHANNELS_KEY).await,
        };
        info!(
            blocked = markers.blocked.len(),
            pinned = markers.pinned.len(),
            muted = markers.muted.len(),
            "markers: loaded"
        );
        Self {
            storage,
            cache: Mutex::new(markers),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Markers> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_blocked(&self, address: &PeerAddress) -> bool {
        self.cache().blocked.contains(address)
    }

    pub fn blocked(&self) -> Vec<PeerAddress> {
        self.cache().blocked.iter().cloned().collect()
    }

    pub async fn block(&self, address: &PeerAddress) -> Result<()> {
        self.update_blocked(|blocked| blocked.insert(address.clone()))
            .await
    }

    pub async fn unblock(&self, address: &PeerAddress) -> Result<()> {
        self.update_blocked(|blocked| blocked.remove(address)).await
    }

    async fn update_blocked<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeSet<PeerAddress>) -> bool,
    {
        let _write = self.writes.lock().await;
        let mut blocked = self.cache().blocked.clone();
        if !change(&mut blocked) {
            return Ok(());
        }
        self.save(BLOCKED_ADDRESSES_KEY, &blocked).await?;
        self.cache().blocked = blocked;
        Ok(())
    }

    pub fn pinned(&self, channel: &PeerAddress) -> Option<Message> {
        self.cache().pinned.get(channel).cloned()
    }

    /// Pins `message` for `channel`, replacing any earlier pin.
    pub async fn pin(&self, channel: &PeerAddress, message: Message) -> Result<()> {
        let _write = self.writes.lock().await;
        let mut pinned = self.cache().pinned.clone();
        pinned.insert(channel.clone(), message);
        self.save(PINNED_MESSAGES_KEY, &pinned).await?;
        self.cache().pinned = pinned;
        Ok(())
    }

    pub async fn unpin(&self, channel: &PeerAddress) -> Result<()> {
        let _write = self.writes.lock().await;
        let mut pinned = self.cache().pinned.clone();
        if pinned.remove(channel).is_none() {
            return Ok(());
        }
        self.save(PINNED_MESSAGES_KEY, &pinned).await?;
        self.cache().pinned = pinned;
        Ok(())
    }

    pub fn is_muted(&self, channel: &PeerAddress) -> bool {
        self.cache().muted.contains(channel)
    }

    pub fn muted(&self) -> Vec<PeerAddress> {
        self.cache().muted.iter().cloned().collect()
    }

    pub async fn mute(&self, channel: &PeerAddress) -> Result<()> {
        self.update_muted(|muted| muted.insert(channel.clone())).await
    }

    pub async fn unmute(&self, channel: &PeerAddress) -> Result<()> {
        self.update_muted(|muted| muted.remove(channel)).await
    }

    async fn update_muted<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeSet<PeerAddress>) -> bool,
    {
        let _write = self.writes.lock().await;
        let mut muted = self.cache().muted.clone();
        if !change(&mut muted) {
            return Ok(());
        }
        self.save(MUTED_CHANNELS_KEY, &muted).await?;
        self.cache().muted = muted;
        Ok(())
    }

    async fn save<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.storage
            .save_json(key, value)
            .await
            .map_err(SyncError::Storage)
    }
}

async fn load_or_default<T: DeserializeOwned + Default>(storage: &Storage, key: &str) -> T {
    match storage.load_json::<T>(key).await {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            warn!(key, error = %format!("{err:#}"), "markers: unreadable blob, starting empty");
            T::default()
        }
    }
}

#[cfg(test)]
#[path = "tests/markers_tests.rs"]
mod tests;
