//! Conversation synchronization engine.
//!
//! Merges bulk conversation listing, the live inbound subscription and
//! backward history pagination into one ordered, duplicate-free timeline per
//! channel plus a channel list ordered by recent activity.

pub mod config;
pub mod error;
pub mod ledger;
pub mod markers;
pub mod pager;
pub mod session;
pub mod store;
pub mod stream_manager;
pub mod transport;

pub use config::{load_settings, load_settings_from, prepare_database_url, Settings};
pub use error::SyncError;
pub use ledger::DedupLedger;
pub use markers::MarkerStore;
pub use pager::{HistoryPage, HistoryPager};
pub use session::ChatSession;
pub use store::{reduce, Action, ChatState, ChatStore, LoadingFlags, LoadingScope};
pub use stream_manager::{StreamManager, StreamSink, StreamState};
pub use transport::{
    memory::{MemoryClient, MemoryNetwork},
    Conversation, EventSource, IdentityProvider, MessagingClient, Page, PageCursor, StaticIdentity,
};
