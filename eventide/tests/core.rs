//! Integration tests for the storage ports and the in-memory backends.

use std::sync::Arc;

use eventide::{
    Error, ExpectedVersion, SnapshotStore, StreamStore,
    store::{
        EventData, in_memory::InMemoryStreamStore, in_memory_snapshot::InMemorySnapshotStore,
        in_memory_subscription::InMemoryPersistentSubscription,
    },
    subscription::{DropReason, NackAction, Subscription, SubscriptionClient, SubscriptionMessage},
};
use futures::StreamExt;
use pretty_assertions::assert_eq;

fn event(name: &str) -> EventData<Vec<u8>> {
    EventData::new(name, format!("{{\"name\":\"{name}\"}}").into_bytes())
}

// -- Stream store ----------------------------------------------------------

#[test]
fn in_memory_stream_store_append_and_read() {
    let store = InMemoryStreamStore::<Vec<u8>>::default();

    let version = futures::executor::block_on(store.append(
        "cart-1",
        ExpectedVersion::NewStream,
        vec![event("ItemAdded"), event("ItemRemoved")],
    ))
    .expect("append should succeed");
    assert_eq!(version, 1, "positions are zero-based");

    let events = futures::executor::block_on(store.read("cart-1", 0)).expect("read should succeed");
    let names = events.iter().map(|e| e.event_name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["ItemAdded", "ItemRemoved"]);
    assert_eq!(events[1].position, 1);
    assert_eq!(events[1].stream, "cart-1");
}

#[test]
fn in_memory_stream_store_conflict() {
    let store = InMemoryStreamStore::<Vec<u8>>::default();
    futures::executor::block_on(store.append("cart-1", ExpectedVersion::NewStream, vec![event("a")]))
        .expect("initial append");

    // Appending with a stale expectation should yield a conflict.
    let err = futures::executor::block_on(store.append(
        "cart-1",
        ExpectedVersion::NewStream,
        vec![event("b")],
    ))
    .expect_err("should conflict");
    assert!(matches!(
        err,
        Error::Conflict {
            expected: ExpectedVersion::NewStream,
            actual: 0,
            ..
        }
    ));

    // `Any` skips the check.
    let version =
        futures::executor::block_on(store.append("cart-1", ExpectedVersion::Any, vec![event("c")]))
            .expect("unchecked append");
    assert_eq!(version, 1);
}

#[test]
fn in_memory_stream_store_missing_stream_reads_empty() {
    let store = InMemoryStreamStore::<Vec<u8>>::default();
    let events = futures::executor::block_on(store.read("nothing-here", 0)).expect("read");
    assert!(events.is_empty());
}

#[test]
fn in_memory_stream_store_empty_batch_is_noop() {
    let store = InMemoryStreamStore::<Vec<u8>>::default();
    futures::executor::block_on(store.append("cart-1", ExpectedVersion::NewStream, vec![event("a")]))
        .expect("initial append");

    let version =
        futures::executor::block_on(store.append("cart-1", ExpectedVersion::Exact(0), Vec::new()))
            .expect("empty append");
    assert_eq!(version, 0);
    assert_eq!(store.stream_len("cart-1"), 1);
}

// -- Snapshot store --------------------------------------------------------

#[test]
fn snapshot_store_save_and_load() {
    let snapshots = InMemorySnapshotStore::<Vec<u8>>::default();

    futures::executor::block_on(snapshots.save("cartSnapshot-1", 3, b"{}".to_vec()))
        .expect("save snapshot");

    let loaded = futures::executor::block_on(snapshots.load("cartSnapshot-1")).expect("load");
    let snapshot = loaded.expect("snapshot should exist");
    assert_eq!(snapshot.version(), 3);
    assert_eq!(snapshot.into_payload(), b"{}".to_vec());

    let missing = futures::executor::block_on(snapshots.load("cartSnapshot-2")).expect("load");
    assert!(missing.is_none());
}

// -- Persistent subscription -----------------------------------------------

#[tokio::test]
async fn in_memory_subscription_redelivers_unsettled_events() {
    let subscription = InMemoryPersistentSubscription::<Vec<u8>>::default();
    let acked = subscription.publish("ItemAdded", b"1".to_vec());
    let parked = subscription.publish("ItemAdded", b"2".to_vec());
    let pending = subscription.publish("ItemAdded", b"3".to_vec());

    let mut first = subscription.subscribe().await.expect("subscribe");
    for _ in 0..3 {
        first.messages.next().await.expect("delivery");
    }
    first.handle.ack(acked).await.expect("ack");
    first
        .handle
        .nack(NackAction::Park, "parked", parked)
        .await
        .expect("nack");
    subscription.drop_subscription(DropReason::ServerError("connection reset".into()));
    assert_eq!(
        first.messages.next().await,
        Some(SubscriptionMessage::Dropped(DropReason::ServerError(
            "connection reset".into()
        )))
    );
    assert!(first.messages.next().await.is_none());

    let mut second = subscription.subscribe().await.expect("resubscribe");
    match second.messages.next().await {
        Some(SubscriptionMessage::Event(event)) => assert_eq!(event.event_id, pending),
        other => panic!("expected redelivery, got {other:?}"),
    }
    assert_eq!(subscription.acked(), vec![acked]);
    assert_eq!(subscription.nacked()[0].action, NackAction::Park);
    assert_eq!(subscription.subscribe_count(), 2);
}

#[tokio::test]
async fn in_memory_subscription_close_ends_feed() {
    let subscription = Arc::new(InMemoryPersistentSubscription::<Vec<u8>>::default());
    subscription.caught_up();

    let mut feed = subscription.subscribe().await.expect("subscribe");
    assert_eq!(feed.messages.next().await, Some(SubscriptionMessage::CaughtUp));
    assert!(subscription.is_subscribed());

    feed.handle.close();
    feed.handle.close();
    assert!(feed.messages.next().await.is_none());
    assert!(!subscription.is_subscribed());
}
