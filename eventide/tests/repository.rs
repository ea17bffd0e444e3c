//! Integration tests for the aggregate repository.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use eventide::{
    AggregateRegistration, AggregateRegistry, AggregateRepository, Error, ExpectedVersion,
    SnapshotStore, StreamStore, async_trait,
    codec::JsonCodec,
    snapshot::Snapshot,
    store::{
        EventData, RecordedEvent, in_memory::InMemoryStreamStore,
        in_memory_snapshot::InMemorySnapshotStore,
    },
};
use eventide_derive::Event as DeriveEvent;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, DeriveEvent)]
struct ItemAdded {
    sku: String,
    quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, DeriveEvent)]
struct ItemRemoved {
    sku: String,
}

struct AddItem {
    sku: &'static str,
    quantity: u32,
}

struct RemoveItem {
    sku: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Cart {
    items: BTreeMap<String, u32>,
    applied: u32,
}

fn registry() -> AggregateRegistry<JsonCodec> {
    AggregateRegistry::builder()
        .register(
            AggregateRegistration::<Cart, JsonCodec>::new(Cart::default)
                .persistence_key(|id| format!("cart-{id}"))
                .snapshot_key(|id| format!("cartSnapshot-{id}"))
                .command::<AddItem, _>(|_, cmd| {
                    if cmd.quantity == 0 {
                        return Err(Error::Validation("quantity must be positive".into()));
                    }
                    Ok(vec![
                        ItemAdded {
                            sku: cmd.sku.to_string(),
                            quantity: cmd.quantity,
                        }
                        .into(),
                    ])
                })
                .command::<RemoveItem, _>(|cart, cmd| {
                    if !cart.items.contains_key(cmd.sku) {
                        return Ok(Vec::new());
                    }
                    Ok(vec![
                        ItemRemoved {
                            sku: cmd.sku.to_string(),
                        }
                        .into(),
                    ])
                })
                .event::<ItemAdded, _>(|mut cart, e| {
                    *cart.items.entry(e.sku.clone()).or_default() += e.quantity;
                    cart.applied += 1;
                    cart
                })
                .event::<ItemRemoved, _>(|mut cart, e| {
                    cart.items.remove(&e.sku);
                    cart.applied += 1;
                    cart
                }),
        )
        .build()
        .expect("valid registry")
}

type Repository<St, Sn> = AggregateRepository<St, Sn, JsonCodec>;

fn in_memory_repository(
    store: &InMemoryStreamStore<Vec<u8>>,
) -> Repository<InMemoryStreamStore<Vec<u8>>, InMemorySnapshotStore<Vec<u8>>> {
    AggregateRepository::new(
        Arc::new(store.clone()),
        None,
        Arc::new(registry()),
        JsonCodec,
    )
}

/// Stream store wrapper counting the events handed out by `read`.
#[derive(Default)]
struct CountingStore {
    inner: InMemoryStreamStore<Vec<u8>>,
    events_read: AtomicUsize,
}

#[async_trait]
impl StreamStore for CountingStore {
    type Raw = Vec<u8>;

    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData<Vec<u8>>>,
    ) -> eventide::Result<i64> {
        self.inner.append(stream, expected, events).await
    }

    async fn read(&self, stream: &str, start: i64) -> eventide::Result<Vec<RecordedEvent<Vec<u8>>>> {
        let events = self.inner.read(stream, start).await?;
        self.events_read.fetch_add(events.len(), Ordering::SeqCst);
        Ok(events)
    }
}

/// Snapshot store whose writes always fail.
struct BrokenSnapshotStore;

#[async_trait]
impl SnapshotStore for BrokenSnapshotStore {
    type Raw = Vec<u8>;

    async fn save(&self, _key: &str, _version: i64, _payload: Vec<u8>) -> eventide::Result<()> {
        Err(Error::Store("disk full".into()))
    }

    async fn load(&self, _key: &str) -> eventide::Result<Option<Snapshot<Vec<u8>>>> {
        Ok(None)
    }
}

#[test_log::test(tokio::test)]
async fn new_aggregate_starts_from_initial_state() {
    let repository = in_memory_repository(&InMemoryStreamStore::default());

    let cart = repository.load::<Cart>("1").await.expect("load");

    assert!(cart.is_new());
    assert_eq!(cart.version(), -1);
    assert_eq!(cart.stream_name(), "cart-1");
    assert_eq!(cart.state(), &Cart::default());
}

#[test_log::test(tokio::test)]
async fn saved_events_round_trip() {
    let store = InMemoryStreamStore::default();
    let repository = in_memory_repository(&store);

    let mut cart = repository.load::<Cart>("1").await.expect("load");
    repository
        .dispatch_command(&mut cart, AddItem { sku: "apple", quantity: 2 })
        .expect("add apple");
    repository
        .dispatch_command(&mut cart, AddItem { sku: "pear", quantity: 1 })
        .expect("add pear");
    let produced = repository
        .dispatch_command(&mut cart, RemoveItem { sku: "pear" })
        .expect("remove pear");
    assert_eq!(produced.len(), 1);
    assert_eq!(
        produced[0].downcast_ref::<ItemRemoved>(),
        Some(&ItemRemoved { sku: "pear".into() })
    );
    assert_eq!(cart.pending_events().len(), 3);

    let version = repository.save(&mut cart).await.expect("save");
    assert_eq!(version, 2);
    assert_eq!(cart.version(), 2);
    assert!(cart.pending_events().is_empty());

    let reloaded = repository.load::<Cart>("1").await.expect("reload");
    assert_eq!(reloaded.version(), 2);
    assert_eq!(reloaded.state(), cart.state());
    assert_eq!(reloaded.state().items, BTreeMap::from([("apple".to_string(), 2)]));
    assert_eq!(store.stream_len("cart-1"), 3);
}

#[test_log::test(tokio::test)]
async fn save_without_pending_events_is_a_noop() {
    let store = InMemoryStreamStore::default();
    let repository = in_memory_repository(&store);
    repository
        .execute::<Cart, _>("1", AddItem { sku: "apple", quantity: 1 })
        .await
        .expect("execute");

    let mut cart = repository.load::<Cart>("1").await.expect("load");
    repository
        .dispatch_command(&mut cart, RemoveItem { sku: "banana" })
        .expect("nothing to remove");

    assert_eq!(repository.save(&mut cart).await.expect("save"), 0);
    assert_eq!(store.stream_len("cart-1"), 1);
}

#[test_log::test(tokio::test)]
async fn concurrent_saves_conflict() {
    let repository = in_memory_repository(&InMemoryStreamStore::default());
    repository
        .execute::<Cart, _>("1", AddItem { sku: "apple", quantity: 1 })
        .await
        .expect("seed");

    let mut first = repository.load::<Cart>("1").await.expect("load first");
    let mut second = repository.load::<Cart>("1").await.expect("load second");
    repository
        .dispatch_command(&mut first, AddItem { sku: "pear", quantity: 1 })
        .expect("dispatch first");
    repository
        .dispatch_command(&mut second, AddItem { sku: "plum", quantity: 1 })
        .expect("dispatch second");

    let (a, b) = tokio::join!(repository.save(&mut first), repository.save(&mut second));
    let (winner, loser) = match (a, b) {
        (Ok(version), Err(err)) => (version, err),
        (Err(err), Ok(version)) => (version, err),
        other => panic!("expected exactly one conflict, got {other:?}"),
    };
    assert_eq!(winner, 1);
    assert!(loser.is_conflict(), "unexpected error: {loser}");

    // The losing aggregate keeps its pending events for a retry.
    let lost = if first.version() == 0 { &first } else { &second };
    assert_eq!(lost.pending_events().len(), 1);
}

#[test_log::test(tokio::test)]
async fn conflicting_save_can_be_retried_after_reload() {
    let repository = in_memory_repository(&InMemoryStreamStore::default());
    let mut stale = repository.load::<Cart>("1").await.expect("load");
    repository
        .execute::<Cart, _>("1", AddItem { sku: "apple", quantity: 1 })
        .await
        .expect("concurrent writer");

    repository
        .dispatch_command(&mut stale, AddItem { sku: "pear", quantity: 1 })
        .expect("dispatch");
    let err = repository.save(&mut stale).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Conflict {
            expected: ExpectedVersion::NewStream,
            actual: 0,
            ..
        }
    ));

    let retried = repository
        .execute::<Cart, _>("1", AddItem { sku: "pear", quantity: 1 })
        .await
        .expect("retry");
    assert_eq!(retried.version(), 1);
    assert_eq!(retried.state().items.len(), 2);
}

#[test_log::test(tokio::test)]
async fn rejected_commands_leave_the_aggregate_untouched() {
    let repository = in_memory_repository(&InMemoryStreamStore::default());
    let mut cart = repository.load::<Cart>("1").await.expect("load");

    let err = repository
        .dispatch_command(&mut cart, AddItem { sku: "apple", quantity: 0 })
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = repository.dispatch_command(&mut cart, "not a command").unwrap_err();
    assert!(matches!(err, Error::UnregisteredCommand(_)));
    assert!(cart.pending_events().is_empty());
    assert_eq!(cart.state(), &Cart::default());
}

#[test_log::test(tokio::test)]
async fn unregistered_aggregate_is_an_error() {
    let repository = in_memory_repository(&InMemoryStreamStore::default());

    let err = repository.load::<String>("1").await.unwrap_err();
    assert!(matches!(err, Error::UnregisteredAggregate(_)));

    let err = repository.load::<Cart>("").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test_log::test(tokio::test)]
async fn snapshot_shortcuts_replay() {
    let store = Arc::new(CountingStore::default());
    let snapshots = Arc::new(InMemorySnapshotStore::<Vec<u8>>::default());
    let repository = AggregateRepository::new(
        Arc::clone(&store),
        Some(Arc::clone(&snapshots)),
        Arc::new(registry()),
        JsonCodec,
    )
    .with_snapshot_frequency(Some(5));

    let skus = ["a", "b", "c", "d", "e", "f", "g"];
    for (i, sku) in skus.into_iter().enumerate() {
        let cart = repository
            .execute::<Cart, _>("1", AddItem { sku, quantity: 1 })
            .await
            .expect("execute");
        assert_eq!(cart.version(), i as i64);
    }

    let snapshot = snapshots
        .load("cartSnapshot-1")
        .await
        .expect("load snapshot")
        .expect("snapshot written when the fifth event was saved");
    assert_eq!(snapshot.version(), 4);

    store.events_read.store(0, Ordering::SeqCst);
    let from_snapshot = repository.load::<Cart>("1").await.expect("load");
    assert_eq!(store.events_read.load(Ordering::SeqCst), 2);

    let full_replay = AggregateRepository::new(
        Arc::clone(&store),
        None::<Arc<InMemorySnapshotStore<Vec<u8>>>>,
        Arc::new(registry()),
        JsonCodec,
    )
    .load::<Cart>("1")
    .await
    .expect("full replay");

    assert_eq!(from_snapshot.version(), 6);
    assert_eq!(from_snapshot.state(), full_replay.state());
    assert_eq!(from_snapshot.state().applied, 7);
}

#[test_log::test(tokio::test)]
async fn failed_snapshot_does_not_fail_the_save() {
    let store = InMemoryStreamStore::default();
    let repository = AggregateRepository::new(
        Arc::new(store.clone()),
        Some(Arc::new(BrokenSnapshotStore)),
        Arc::new(registry()),
        JsonCodec,
    )
    .with_snapshot_frequency(Some(1));

    let cart = repository
        .execute::<Cart, _>("1", AddItem { sku: "apple", quantity: 1 })
        .await
        .expect("save succeeds even though the snapshot write fails");

    assert_eq!(cart.version(), 0);
    assert_eq!(store.stream_len("cart-1"), 1);
}

#[test_log::test(tokio::test)]
async fn undecodable_events_are_reported_and_skipped() {
    let store = InMemoryStreamStore::default();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let repository = {
        let reported = Arc::clone(&reported);
        in_memory_repository(&store).with_decode_error_handler(move |record, err| {
            assert!(err.is_decode_failure());
            reported.lock().push(record.position);
        })
    };

    let mut cart = repository.load::<Cart>("1").await.expect("load");
    for sku in ["apple", "pear", "plum"] {
        repository
            .dispatch_command(&mut cart, AddItem { sku, quantity: 1 })
            .expect("dispatch");
    }
    repository.save(&mut cart).await.expect("save");
    assert!(store.replace_payload("cart-1", 1, b"not json".to_vec()));

    let reloaded = repository.load::<Cart>("1").await.expect("load skips corrupt record");

    assert_eq!(*reported.lock(), vec![1]);
    assert_eq!(reloaded.version(), 2);
    assert_eq!(
        reloaded.state().items.keys().cloned().collect::<Vec<_>>(),
        vec!["apple".to_string(), "plum".to_string()]
    );
}
