use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::DateTime;
use shared::error::ErrorCode;
use tokio::sync::Semaphore;

use super::*;
use crate::transport::{
    memory::{MemoryClient, MemoryNetwork},
    Conversation, EventSource, StaticIdentity,
};

fn addr(n: u8) -> PeerAddress {
    PeerAddress::parse(&format!("0x{:040x}", n)).expect("address")
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp")
}

fn test_settings() -> Settings {
    Settings {
        stop_timeout_ms: 500,
        ..Settings::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Harness {
    network: Arc<MemoryNetwork>,
    session: ChatSession,
}

impl Harness {
    fn new() -> Self {
        Self::with_markers(None)
    }

    fn with_markers(markers: Option<Arc<MarkerStore>>) -> Self {
        let network = MemoryNetwork::new();
        for n in 2..=4 {
            network.register(&addr(n));
        }
        let session = ChatSession::from_parts(
            Arc::new(StaticIdentity::new(addr(1))),
            &test_settings(),
            Arc::new(DedupLedger::new()),
            markers,
        );
        Self { network, session }
    }

    fn client(&self) -> Arc<dyn MessagingClient> {
        Arc::new(self.network.client(addr(1)))
    }

    async fn connect(&self) {
        self.session.connect(self.client()).await.expect("connect");
    }

    fn channel_order(&self) -> Vec<PeerAddress> {
        self.session
            .state()
            .channels
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    fn timeline(&self, channel: &PeerAddress) -> Vec<Message> {
        self.session.state().messages_for(channel).to_vec()
    }
}

#[tokio::test]
async fn connect_requires_a_ready_identity() {
    let network = MemoryNetwork::new();
    let session = ChatSession::new(Arc::new(StaticIdentity::unavailable()), &test_settings());
    let result = session.connect(Arc::new(network.client(addr(1)))).await;

    assert!(matches!(result, Err(SyncError::IdentityUnavailable)));
    assert_eq!(
        session.state().last_error.as_ref().map(|e| e.code),
        Some(ErrorCode::Unauthenticated)
    );
    assert_eq!(session.stream_state(), StreamState::Idle);
}

#[tokio::test]
async fn listing_orders_channels_and_live_messages_reorder_them() {
    let h = Harness::new();
    h.network.post_at(&addr(2), &addr(1), "from A", at(1_000));
    h.network.post_at(&addr(3), &addr(1), "from B", at(2_000));

    h.connect().await;
    assert_eq!(h.channel_order(), vec![addr(3), addr(2)]);
    assert_eq!(
        h.session.state().channel(&addr(3)).map(|c| c.last_message_at),
        Some(2_000_000)
    );
    assert_eq!(h.session.stream_state(), StreamState::Streaming);

    h.network.post(&addr(2), &addr(1), "A again");
    wait_until(|| h.channel_order() == vec![addr(2), addr(3)]).await;
    assert_eq!(h.session.state().unread(&addr(2)), 1);
}

#[tokio::test]
async fn redelivered_message_is_folded_once() {
    let h = Harness::new();
    h.connect().await;

    let raw = h.network.post(&addr(2), &addr(1), "m1");
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;
    h.network.redeliver(&raw);
    h.network.post(&addr(2), &addr(1), "m2");
    wait_until(|| h.timeline(&addr(2)).len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let contents: Vec<String> = h.timeline(&addr(2)).into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["m1", "m2"]);
    assert_eq!(h.session.state().unread(&addr(2)), 2);
}

#[tokio::test]
async fn history_and_live_stream_never_duplicate() {
    let h = Harness::new();
    let old = h.network.post_at(&addr(2), &addr(1), "old", at(1_000));
    h.connect().await;

    h.session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select channel");
    assert_eq!(h.timeline(&addr(2)).len(), 1);
    assert_eq!(h.timeline(&addr(2))[0].status, Some(MessageStatus::Sent));

    h.network.redeliver(&old);
    h.network.post(&addr(2), &addr(1), "new");
    wait_until(|| h.timeline(&addr(2)).len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.timeline(&addr(2)).len(), 2);
    assert_eq!(h.session.state().unread(&addr(2)), 0);
}

#[tokio::test]
async fn fetch_merges_messages_the_stream_folded_first() {
    let h = Harness::new();
    h.connect().await;
    h.network.post(&addr(2), &addr(1), "live first");
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;

    h.network.post_at(&addr(3), &addr(1), "unrelated", at(10));
    h.session.fetch_messages(&addr(2)).await.expect("fetch");
    let timeline = h.timeline(&addr(2));
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "live first");
}

#[tokio::test]
async fn paging_through_the_session_fills_the_timeline_in_order() {
    let h = Harness::new();
    for n in 0..100 {
        h.network
            .post_at(&addr(2), &addr(1), format!("msg {n}"), at(1_000 + n));
    }
    h.connect().await;

    h.session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select channel");
    assert_eq!(h.timeline(&addr(2)).len(), 50);
    assert_eq!(h.timeline(&addr(2))[0].content, "msg 50");

    assert_eq!(h.session.load_older_messages().await.expect("older"), 50);
    let timeline = h.timeline(&addr(2));
    assert_eq!(timeline.len(), 100);
    assert_eq!(timeline[0].content, "msg 0");
    assert!(timeline.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    assert_eq!(h.session.load_older_messages().await.expect("exhausted"), 0);
    assert!(!h.session.state().loading.older_messages);
}

#[tokio::test]
async fn switching_channels_discards_the_cursor() {
    let h = Harness::new();
    for n in 0..60 {
        h.network
            .post_at(&addr(2), &addr(1), format!("msg {n}"), at(1_000 + n));
    }
    h.connect().await;
    h.session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select channel");
    h.session.set_current_channel(None).await.expect("deselect");

    assert!(matches!(
        h.session.load_older_messages().await,
        Err(SyncError::NoActiveCursor)
    ));
}

#[tokio::test]
async fn unreachable_peer_is_rejected_before_opening_a_conversation() {
    let h = Harness::new();
    h.connect().await;

    let result = h.session.fetch_messages(&addr(9)).await;
    assert!(matches!(result, Err(SyncError::NotMessageable(ref peer)) if peer == &addr(9)));
    assert_eq!(h.network.open_conversation_calls(), 0);
    assert_eq!(
        h.session.state().channel_error(&addr(9)).map(|e| e.code),
        Some(ErrorCode::NotMessageable)
    );
}

#[tokio::test]
async fn create_channel_validates_before_touching_the_network() {
    let h = Harness::new();
    h.connect().await;

    assert!(matches!(
        h.session.create_channel("0x1234").await,
        Err(SyncError::InvalidIdentifier(_))
    ));
    assert!(matches!(
        h.session.create_channel(addr(1).as_str()).await,
        Err(SyncError::SelfConversation)
    ));
    assert_eq!(h.network.can_message_calls(), 0);

    assert!(matches!(
        h.session.create_channel(addr(9).as_str()).await,
        Err(SyncError::NotMessageable(_))
    ));
    assert_eq!(h.network.open_conversation_calls(), 0);

    let created = h
        .session
        .create_channel("0x0000000000000000000000000000000000000004")
        .await
        .expect("create");
    assert_eq!(created, addr(4));
    assert!(h.session.state().channel(&addr(4)).is_some());
    assert!(h.session.ledger().has_seen_channel(&addr(4)));
}

#[tokio::test]
async fn optimistic_send_is_confirmed_in_place() {
    let h = Harness::new();
    h.connect().await;

    let id = h
        .session
        .send_message(&addr(2), "  hello  ")
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let timeline = h.timeline(&addr(2));
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, id);
    assert_eq!(timeline[0].content, "hello");
    assert_eq!(timeline[0].status, Some(MessageStatus::Sent));
    assert_eq!(h.session.state().unread(&addr(2)), 0);
    assert_eq!(h.channel_order(), vec![addr(2)]);
}

#[tokio::test]
async fn failed_send_keeps_a_failed_placeholder() {
    let h = Harness::new();
    h.connect().await;
    h.network.set_send_failure(Some("quota exceeded"));

    let result = h.session.send_message(&addr(2), "hello").await;
    assert!(matches!(result, Err(SyncError::SendFailed(_))));
    let timeline = h.timeline(&addr(2));
    assert_eq!(timeline.len(), 1);
    assert!(timeline[0].id.as_str().starts_with("local-"));
    assert_eq!(timeline[0].status, Some(MessageStatus::Failed));
    assert_eq!(
        h.session.state().channel_error(&addr(2)).map(|e| e.code),
        Some(ErrorCode::SendFailed)
    );

    assert!(matches!(
        h.session.send_message(&addr(2), "   ").await,
        Err(SyncError::EmptyMessage)
    ));
}

#[tokio::test]
async fn unread_skips_current_and_muted_channels() {
    let markers = Arc::new(
        MarkerStore::connect("sqlite::memory:")
            .await
            .expect("markers"),
    );
    markers.mute(&addr(3)).await.expect("mute");
    let h = Harness::with_markers(Some(markers));
    h.connect().await;
    h.session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select channel");

    h.network.post(&addr(2), &addr(1), "to current");
    h.network.post(&addr(3), &addr(1), "to muted");
    h.network.post(&addr(4), &addr(1), "to other");
    wait_until(|| h.timeline(&addr(4)).len() == 1 && h.timeline(&addr(3)).len() == 1).await;
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;

    let state = h.session.state();
    assert_eq!(state.unread(&addr(2)), 0);
    assert_eq!(state.unread(&addr(3)), 0);
    assert_eq!(state.unread(&addr(4)), 1);
}

#[tokio::test]
async fn blocked_peers_are_hidden_from_listing_and_stream() {
    let markers = Arc::new(
        MarkerStore::connect("sqlite::memory:")
            .await
            .expect("markers"),
    );
    markers.block(&addr(3)).await.expect("block");
    let h = Harness::with_markers(Some(markers));
    h.network.post_at(&addr(2), &addr(1), "hi", at(1_000));
    h.network.post_at(&addr(3), &addr(1), "spam", at(2_000));
    h.connect().await;
    assert_eq!(h.channel_order(), vec![addr(2)]);

    h.network.post(&addr(3), &addr(1), "more spam");
    h.network.post(&addr(2), &addr(1), "hello again");
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.timeline(&addr(3)).is_empty());
    assert!(h.session.state().channel(&addr(3)).is_none());
}

#[tokio::test]
async fn reconnect_replaces_the_subscription() {
    let h = Harness::new();
    h.connect().await;
    h.connect().await;
    assert_eq!(h.network.subscriber_count(&addr(1)), 1);

    h.network.post(&addr(2), &addr(1), "once");
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.timeline(&addr(2)).len(), 1);
}

#[tokio::test]
async fn disconnect_stops_folding_and_unbinds() {
    let h = Harness::new();
    h.connect().await;
    h.session.disconnect().await;
    h.session.disconnect().await;

    assert_eq!(h.session.stream_state(), StreamState::Idle);
    assert_eq!(h.network.subscriber_count(&addr(1)), 0);
    h.network.post(&addr(2), &addr(1), "nobody listening");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.timeline(&addr(2)).is_empty());
    assert!(matches!(
        h.session.fetch_messages(&addr(2)).await,
        Err(SyncError::NoClient)
    ));
}

#[tokio::test]
async fn stream_failure_is_recorded_as_a_global_error() {
    let h = Harness::new();
    h.connect().await;
    h.network.break_streams("connection reset");

    wait_until(|| h.session.state().last_error.is_some()).await;
    assert_eq!(
        h.session.state().last_error.as_ref().map(|e| e.code),
        Some(ErrorCode::Transport)
    );
    assert_eq!(h.session.stream_state(), StreamState::Failed);

    h.connect().await;
    assert_eq!(h.session.stream_state(), StreamState::Streaming);
    assert!(h.session.state().last_error.is_none());
}

#[tokio::test]
async fn listing_failure_surfaces_without_dropping_the_stream() {
    let h = Harness::new();
    h.network.set_listing_failure(Some("gateway timeout"));
    let result = h.session.connect(h.client()).await;

    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(
        h.session.state().last_error.as_ref().map(|e| e.code),
        Some(ErrorCode::Transport)
    );
    assert_eq!(h.session.stream_state(), StreamState::Streaming);
    assert!(!h.session.state().loading.channels);
}

struct SwitchableIdentity(Mutex<PeerAddress>);

impl IdentityProvider for SwitchableIdentity {
    fn current_address(&self) -> Option<PeerAddress> {
        Some(self.0.lock().expect("identity").clone())
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn identity_change_resets_state_and_ledger() {
    let network = MemoryNetwork::new();
    network.register(&addr(2));
    network.post_at(&addr(2), &addr(1), "for one", at(1_000));
    network.post_at(&addr(2), &addr(5), "for five", at(2_000));
    let identity = Arc::new(SwitchableIdentity(Mutex::new(addr(1))));
    let session = ChatSession::new(identity.clone(), &test_settings());

    session
        .connect(Arc::new(network.client(addr(1))))
        .await
        .expect("connect as one");
    session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select");
    let first_ledger = session.ledger();
    assert_eq!(first_ledger.seen_message_count(), 1);

    *identity.0.lock().expect("identity") = addr(5);
    session
        .connect(Arc::new(network.client(addr(5))))
        .await
        .expect("connect as five");

    let state = session.state();
    assert_eq!(state.current_channel_id, None);
    assert!(state.messages.is_empty());
    assert_eq!(state.channels.len(), 1);
    assert_eq!(session.local_address(), Some(addr(5)));
    assert_eq!(session.ledger().seen_message_count(), 0);
    assert_eq!(network.subscriber_count(&addr(1)), 0);
}

#[tokio::test]
async fn local_message_operations_patch_the_timeline() {
    let h = Harness::new();
    h.connect().await;
    let raw = h.network.post(&addr(2), &addr(1), "first draft");
    wait_until(|| h.timeline(&addr(2)).len() == 1).await;

    h.session
        .add_reaction(&addr(2), &raw.id, "🔥")
        .expect("react");
    h.session
        .edit_message(&addr(2), &raw.id, "edited")
        .expect("edit");
    h.session.mark_message_read(&addr(2), &raw.id);
    let timeline = h.timeline(&addr(2));
    let message = &timeline[0];
    assert_eq!(message.reactions.get("🔥"), Some(&vec![addr(1)]));
    assert_eq!(message.display_content(), Some("edited"));
    assert_eq!(message.status, Some(MessageStatus::Read));

    assert!(matches!(
        h.session.edit_message(&addr(2), &raw.id, ""),
        Err(SyncError::EmptyMessage)
    ));
    h.session.delete_message(&addr(2), &raw.id);
    let timeline = h.timeline(&addr(2));
    let message = &timeline[0];
    assert!(message.deleted);
    assert_eq!(message.display_content(), None);
}

#[tokio::test]
async fn history_fetch_refreshes_channel_activity() {
    let h = Harness::new();
    h.network.post_at(&addr(2), &addr(1), "old", at(100));
    h.network.post_at(&addr(3), &addr(1), "newer", at(200));
    h.connect().await;
    assert_eq!(h.channel_order(), vec![addr(3), addr(2)]);

    h.network.break_streams("connection reset");
    wait_until(|| h.session.stream_state() == StreamState::Failed).await;
    h.network.post_at(&addr(2), &addr(1), "missed while offline", at(300));

    h.session
        .set_current_channel(Some(addr(2)))
        .await
        .expect("select channel");
    let state = h.session.state();
    assert_eq!(
        state.channel(&addr(2)).map(|c| c.last_message_at),
        Some(300_000)
    );
    assert_eq!(h.channel_order(), vec![addr(2), addr(3)]);
}

#[tokio::test]
async fn echo_of_own_message_settles_the_pending_placeholder() {
    let h = Harness::new();
    h.connect().await;
    let generation = h.session.inner.binding().expect("bound").generation;

    let placeholder_id = MessageId::from("local-pending");
    let store = &h.session.inner.store;
    store.dispatch(Action::CreateChannel(Channel::direct(&addr(1), &addr(2), 1_000)));
    store.dispatch(Action::AddMessage {
        channel_id: addr(2),
        message: Message::new(placeholder_id.clone(), addr(1), "on my way", 1_000)
            .with_status(MessageStatus::Sending),
    });

    let echo = RawMessage {
        id: MessageId::from("net-1"),
        sender_address: addr(1),
        content: "on my way".to_string(),
        sent_at: at(2),
        conversation_peer_address: addr(2),
    };
    h.session.inner.fold_live(generation, echo.clone());

    let timeline = h.timeline(&addr(2));
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id.as_str(), "net-1");
    assert_eq!(timeline[0].status, Some(MessageStatus::Sent));

    store.dispatch(Action::ConfirmMessage {
        channel_id: addr(2),
        placeholder_id,
        message: history_message(echo),
    });
    assert_eq!(h.timeline(&addr(2)).len(), 1);
    assert_eq!(h.session.state().unread(&addr(2)), 0);
}

struct GatedHistory {
    peer: PeerAddress,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Conversation for GatedHistory {
    fn peer_address(&self) -> &PeerAddress {
        &self.peer
    }

    async fn fetch_history(&self, _limit: usize) -> AnyResult<Vec<RawMessage>> {
        self.gate.acquire().await?.forget();
        Ok(Vec::new())
    }

    async fn send(&self, _content: &str) -> AnyResult<RawMessage> {
        anyhow::bail!("read-only")
    }
}

/// Holds history for one peer until the test releases the gate.
struct GatedClient {
    inner: MemoryClient,
    gated: PeerAddress,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl MessagingClient for GatedClient {
    async fn can_message(&self, peer: &PeerAddress) -> AnyResult<bool> {
        self.inner.can_message(peer).await
    }

    async fn list_conversations(&self) -> AnyResult<Vec<Arc<dyn Conversation>>> {
        self.inner.list_conversations().await
    }

    async fn open_conversation(&self, peer: &PeerAddress) -> AnyResult<Arc<dyn Conversation>> {
        if peer == &self.gated {
            return Ok(Arc::new(GatedHistory {
                peer: peer.clone(),
                gate: Arc::clone(&self.gate),
            }));
        }
        self.inner.open_conversation(peer).await
    }

    async fn subscribe(&self) -> AnyResult<Box<dyn EventSource>> {
        self.inner.subscribe().await
    }
}

#[tokio::test]
async fn fetch_superseded_by_a_channel_switch_is_not_an_error() {
    let h = Harness::new();
    let gate = Arc::new(Semaphore::new(0));
    h.session
        .connect(Arc::new(GatedClient {
            inner: h.network.client(addr(1)),
            gated: addr(2),
            gate: Arc::clone(&gate),
        }))
        .await
        .expect("connect");

    let (first, second) = tokio::join!(
        h.session.set_current_channel(Some(addr(2))),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let switched = h.session.set_current_channel(Some(addr(3))).await;
            gate.add_permits(1);
            switched
        }
    );
    first.expect("superseded fetch reports success");
    second.expect("switch");

    let state = h.session.state();
    assert!(state.channel_error(&addr(2)).is_none());
    assert_eq!(state.current_channel_id, Some(addr(3)));
    assert_eq!(h.session.load_older_messages().await.expect("cursor kept"), 0);
}
