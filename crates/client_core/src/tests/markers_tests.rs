use shared::domain::MessageId;
use tempfile::tempdir;

use super::*;

fn addr(n: u8) -> PeerAddress {
    PeerAddress::parse(&format!("0x{:040x}", n)).expect("address")
}

async fn memory_store() -> MarkerStore {
    MarkerStore::connect("sqlite::memory:")
        .await
        .expect("memory marker store")
}

#[tokio::test]
async fn block_and_unblock_are_reflected_immediately() {
    let markers = memory_store().await;
    assert!(!markers.is_blocked(&addr(1)));

    markers.block(&addr(1)).await.expect("block");
    markers.block(&addr(1)).await.expect("block twice");
    assert!(markers.is_blocked(&addr(1)));
    assert_eq!(markers.blocked(), vec![addr(1)]);

    markers.unblock(&addr(1)).await.expect("unblock");
    assert!(!markers.is_blocked(&addr(1)));
    markers.unblock(&addr(9)).await.expect("unblock unknown");
}

#[tokio::test]
async fn markers_survive_reopening_the_database() {
    let dir = tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("markers.db").display());

    {
        let markers = MarkerStore::connect(&url).await.expect("open");
        markers.block(&addr(1)).await.expect("block");
        markers.mute(&addr(2)).await.expect("mute");
        let pinned = Message::new(MessageId::from("m1"), addr(2), "pin me", 42);
        markers.pin(&addr(2), pinned).await.expect("pin");
    }

    let reopened = MarkerStore::connect(&url).await.expect("reopen");
    assert!(reopened.is_blocked(&addr(1)));
    assert!(reopened.is_muted(&addr(2)));
    assert_eq!(reopened.muted(), vec![addr(2)]);
    assert_eq!(
        reopened.pinned(&addr(2)).map(|m| m.content),
        Some("pin me".to_string())
    );
}

#[tokio::test]
async fn blocked_blob_is_a_lowercase_address_array() {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let markers = MarkerStore::open(storage.clone()).await;
    let mixed = PeerAddress::parse("0xABCDEF0000000000000000000000000000000001").expect("address");
    markers.block(&mixed).await.expect("block");

    let raw = storage
        .load_blob(BLOCKED_ADDRESSES_KEY)
        .await
        .expect("load")
        .expect("blob written");
    assert_eq!(raw, r#"["0xabcdef0000000000000000000000000000000001"]"#);
}

#[tokio::test]
async fn pin_replaces_and_unpin_clears() {
    let markers = memory_store().await;
    let first = Message::new(MessageId::from("m1"), addr(2), "first", 1);
    let second = Message::new(MessageId::from("m2"), addr(2), "second", 2);

    markers.pin(&addr(2), first).await.expect("pin");
    markers.pin(&addr(2), second).await.expect("repin");
    assert_eq!(
        markers.pinned(&addr(2)).map(|m| m.id),
        Some(MessageId::from("m2"))
    );

    markers.unpin(&addr(2)).await.expect("unpin");
    assert!(markers.pinned(&addr(2)).is_none());
}

#[tokio::test]
async fn corrupt_blob_falls_back_to_empty() {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    storage
        .save_blob(BLOCKED_ADDRESSES_KEY, "{not json")
        .await
        .expect("seed corrupt blob");
    storage
        .save_json(MUTED_CHANNELS_KEY, &vec![addr(3)])
        .await
        .expect("seed muted");

    let markers = MarkerStore::open(storage).await;
    assert!(markers.blocked().is_empty());
    assert!(markers.is_muted(&addr(3)));

    markers.block(&addr(1)).await.expect("block after corrupt load");
    assert_eq!(markers.blocked(), vec![addr(1)]);
}
