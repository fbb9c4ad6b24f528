//! Backward pagination over one channel's history at a time.

use std::sync::{Mutex, MutexGuard, PoisonError};

use shared::{domain::PeerAddress, protocol::RawMessage};
use tracing::{debug, info};

use crate::{
    error::{Result, SyncError},
    transport::{Conversation, PageCursor},
};

/// One page of history in chronological order.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<RawMessage>,
    pub has_more: bool,
}

struct ActiveCursor {
    channel: PeerAddress,
    /// Taken out while a fetch is in flight; `None` for unpaged transports.
    cursor: Option<Box<dyn PageCursor>>,
    has_more: bool,
    in_flight: bool,
}

#[derive(Default)]
struct CursorSlot {
    /// Bumped whenever the cursor is replaced or discarded, so a fetch that
    /// finishes afterwards can tell its cursor is gone.
    epoch: u64,
    active: Option<ActiveCursor>,
}

pub struct HistoryPager {
    page_size: usize,
    fallback_limit: usize,
    slot: Mutex<CursorSlot>,
}

impl HistoryPager {
    pub fn new(page_size: usize, fallback_limit: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            fallback_limit: fallback_limit.max(1),
            slot: Mutex::new(CursorSlot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, CursorSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_channel(&self) -> Option<PeerAddress> {
        self.slot().active.as_ref().map(|a| a.channel.clone())
    }

    pub fn has_more(&self, channel: &PeerAddress) -> bool {
        self.slot()
            .active
            .as_ref()
            .is_some_and(|a| &a.channel == channel && a.has_more)
    }

    /// Drops the open cursor, if any. Fetches still in flight for it will
    /// fail with [`SyncError::NoActiveCursor`].
    pub fn discard(&self) {
        let mut slot = self.slot();
        slot.epoch += 1;
        if let Some(previous) = slot.active.take() {
            debug!(channel = %previous.channel, "pager: cursor discarded");
        }
    }

    /// Opens a fresh cursor for `channel` and returns its newest page.
    ///
    /// Without paged history support on the transport this falls back to the
    /// most recent `fallback_limit` messages and reports no older pages.
    pub async fn open_initial_page(
        &self,
        channel: &PeerAddress,
        conversation: &dyn Conversation,
    ) -> Result<HistoryPage> {
        let epoch = {
            let mut slot = self.slot();
            slot.epoch += 1;
            slot.active = Some(ActiveCursor {
                channel: channel.clone(),
                cursor: None,
                has_more: false,
                in_flight: true,
            });
            slot.epoch
        };

        let fetched = self.fetch_first_page(conversation).await;
        let mut slot = self.slot();
        if slot.epoch != epoch {
            debug!(%channel, "pager: initial page superseded before it arrived");
            return Err(SyncError::NoActiveCursor);
        }
        let (cursor, page) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                slot.active = None;
                return Err(err);
            }
        };
        if let Some(active) = slot.active.as_mut() {
            active.cursor = cursor;
            active.has_more = page.has_more;
            active.in_flight = false;
        }
        info!(
            %channel,
            messages = page.messages.len(),
            has_more = page.has_more,
            "pager: initial page loaded"
        );
        Ok(page)
    }

    async fn fetch_first_page(
        &self,
        conversation: &dyn Conversation,
    ) -> Result<(Option<Box<dyn PageCursor>>, HistoryPage)> {
        let paged = conversation
            .fetch_history_paged(self.page_size)
            .await
            .map_err(SyncError::Transport)?;

        match paged {
            Some(mut cursor) => {
                let page = cursor.next_page().await.map_err(SyncError::Transport)?;
                let mut messages = page.messages;
                messages.reverse();
                Ok((
                    Some(cursor),
                    HistoryPage {
                        messages,
                        has_more: !page.done,
                    },
                ))
            }
            None => {
                let mut messages = conversation
                    .fetch_history(self.fallback_limit)
                    .await
                    .map_err(SyncError::Transport)?;
                messages.sort_by_key(|m| m.sent_at);
                if messages.len() > self.fallback_limit {
                    messages.drain(..messages.len() - self.fallback_limit);
                }
                Ok((
                    None,
                    HistoryPage {
                        messages,
                        has_more: false,
                    },
                ))
            }
        }
    }

    /// Fetches the page preceding everything loaded so far for `channel`.
    ///
    /// Only one fetch may be outstanding; a concurrent call is rejected with
    /// [`SyncError::PageFetchInFlight`]. Once history is exhausted this
    /// returns an empty page.
    pub async fn load_older_page(&self, channel: &PeerAddress) -> Result<HistoryPage> {
        let (epoch, mut cursor) = {
            let mut slot = self.slot();
            let epoch = slot.epoch;
            let active = slot
                .active
                .as_mut()
                .filter(|a| &a.channel == channel)
                .ok_or(SyncError::NoActiveCursor)?;
            if active.in_flight {
                return Err(SyncError::PageFetchInFlight);
            }
            if !active.has_more {
                return Ok(HistoryPage::default());
            }
            let cursor = active.cursor.take().ok_or(SyncError::NoActiveCursor)?;
            active.in_flight = true;
            (epoch, cursor)
        };

        let fetched = cursor.next_page().await;

        let mut slot = self.slot();
        if slot.epoch != epoch {
            debug!(%channel, "pager: older page dropped, cursor was discarded");
            return Err(SyncError::NoActiveCursor);
        }
        let Some(active) = slot.active.as_mut() else {
            return Err(SyncError::NoActiveCursor);
        };
        active.in_flight = false;
        active.cursor = Some(cursor);
        let page = fetched.map_err(SyncError::Transport)?;
        active.has_more = !page.done;

        let mut messages = page.messages;
        messages.reverse();
        debug!(
            %channel,
            messages = messages.len(),
            has_more = active.has_more,
            "pager: older page loaded"
        );
        Ok(HistoryPage {
            messages,
            has_more: active.has_more,
        })
    }
}

#[cfg(test)]
#[path = "tests/pager_tests.rs"]
mod tests;
