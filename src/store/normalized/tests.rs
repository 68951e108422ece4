use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use super::*;
use crate::config::TailConfig;
use crate::driver::{FailPoint, MemoryDatabase};
use crate::event::HandlerError;
use crate::store::EventStoreMaintenance;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(u64, Option<u64>)>>,
}

impl EventHandler for Recorder {
    fn handle(
        &self,
        event: Arc<Event>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        self.seen
            .lock()
            .unwrap()
            .push((event.version(), event.position()));
        futures::future::ready(Ok(())).boxed()
    }
}

fn options() -> StoreOptions {
    StoreOptions::new().with_tail_config(TailConfig {
        reconnect_interval_ms: 10,
        ..TailConfig::default()
    })
}

async fn open(db: &MemoryDatabase, options: StoreOptions) -> NormalizedStore {
    NormalizedStore::open(
        Arc::new(db.clone()),
        Arc::new(EventRegistry::empty()),
        options,
    )
    .await
    .unwrap()
}

fn batch(stream_id: Uuid, versions: std::ops::RangeInclusive<u64>) -> Vec<Event> {
    versions
        .map(|v| Event::new("Placed", "order", stream_id, v))
        .collect()
}

async fn next(subscription: &mut EventSubscription) -> TailedEvent {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
        .expect("event failed to decode")
}

#[tokio::test]
async fn test_open_creates_counter_once() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    store.save("", batch(Uuid::new_v4(), 1..=2), 0).await.unwrap();

    // Re-opening over existing data must not reset the counter.
    let reopened = open(&db, options()).await;
    assert_eq!(reopened.global_position("").await.unwrap(), 2);
    assert_eq!(db.document_count(STREAMS_COLLECTION).await, 2);
}

#[tokio::test]
async fn test_positions_interleave_across_streams() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    store.save("", batch(a, 1..=2), 0).await.unwrap();
    store.save("", batch(b, 1..=1), 0).await.unwrap();
    store.save("", batch(a, 3..=3), 2).await.unwrap();

    let positions = |events: Vec<Event>| -> Vec<Option<u64>> {
        events.iter().map(Event::position).collect()
    };
    assert_eq!(
        positions(store.load("", a).await.unwrap()),
        vec![Some(1), Some(2), Some(4)]
    );
    assert_eq!(positions(store.load("", b).await.unwrap()), vec![Some(3)]);

    let info = store.stream_info("", a).await.unwrap();
    assert_eq!(info.version, 3);
    assert_eq!(info.position, Some(4));
    assert_eq!(info.stream_type, "order");
    assert!(info.updated_at.is_some());
}

#[tokio::test]
async fn test_load_from_and_unknown_stream() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let id = Uuid::new_v4();
    store.save("", batch(id, 1..=4), 0).await.unwrap();

    let tail: Vec<u64> = store
        .load_from("", id, 3)
        .await
        .unwrap()
        .iter()
        .map(Event::version)
        .collect();
    assert_eq!(tail, vec![3, 4]);
    assert!(store.load_from("", id, 9).await.unwrap().is_empty());

    let err = store.load("", Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::StreamNotFound));
}

#[tokio::test]
async fn test_failed_write_rolls_back_events_and_counter() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let id = Uuid::new_v4();
    store.save("", batch(id, 1..=1), 0).await.unwrap();

    db.fail_next(FailPoint::insert(EVENTS_COLLECTION));
    let err = store.save("", batch(id, 2..=3), 1).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Storage(_)));
    assert_eq!(err.stream_id, Some(id));

    // The summary insert of a new stream fails after its events were staged.
    let other = Uuid::new_v4();
    db.fail_next(FailPoint::insert(STREAMS_COLLECTION));
    assert!(store.save("", batch(other, 1..=2), 0).await.is_err());
    assert!(store.load("", other).await.unwrap_err().is_not_found());

    assert_eq!(store.load("", id).await.unwrap().len(), 1);
    assert_eq!(store.global_position("").await.unwrap(), 1);

    // Nothing was burned: the next save gets the next positions.
    store.save("", batch(id, 2..=3), 1).await.unwrap();
    assert_eq!(store.global_position("").await.unwrap(), 3);
}

#[tokio::test]
async fn test_stale_version_conflicts_without_side_effects() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let id = Uuid::new_v4();
    store.save("", batch(id, 1..=3), 0).await.unwrap();

    // Versions collide with committed events.
    let err = store.save("", batch(id, 2..=2), 1).await.unwrap_err();
    assert!(err.is_version_conflict());
    // Expectation ahead of the stream: events insert, summary check fails.
    let err = store.save("", batch(id, 5..=5), 4).await.unwrap_err();
    assert!(err.is_version_conflict());
    // A second creator of the same stream.
    let err = store.save("", batch(id, 1..=1), 0).await.unwrap_err();
    assert!(err.is_version_conflict());

    assert_eq!(store.global_position("").await.unwrap(), 3);
    assert_eq!(store.stream_info("", id).await.unwrap().version, 3);
}

#[tokio::test]
async fn test_handler_sees_committed_positions() {
    let db = MemoryDatabase::new();
    let recorder = Arc::new(Recorder::default());
    let store = open(&db, options().with_event_handler(recorder.clone())).await;
    let id = Uuid::new_v4();

    store.save("", batch(id, 1..=2), 0).await.unwrap();

    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![(1, Some(1)), (2, Some(2))]
    );
}

#[tokio::test]
async fn test_subscription_delivers_in_commit_order() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let mut subscription = store.subscribe("", None).await.unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    store.save("", batch(a, 1..=2), 0).await.unwrap();
    store.save("", batch(b, 1..=1), 0).await.unwrap();

    for expected in 1..=3 {
        let tailed = next(&mut subscription).await;
        assert_eq!(tailed.event.position(), Some(expected));
    }
}

#[tokio::test]
async fn test_subscription_skips_maintenance_rewrites() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let id = Uuid::new_v4();
    store.save("", batch(id, 1..=1), 0).await.unwrap();
    let mut subscription = store.subscribe("", None).await.unwrap();

    store.rename_event("", "Placed", "Ordered").await.unwrap();
    store.save("", batch(id, 2..=2), 1).await.unwrap();

    let tailed = next(&mut subscription).await;
    assert_eq!(tailed.event.version(), 2);
    assert_eq!(tailed.event.event_type(), "Placed");
}

#[tokio::test]
async fn test_subscription_decode_error_names_event() {
    #[derive(Debug, serde::Serialize)]
    struct Shipped {
        carrier: String,
    }

    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let mut subscription = store.subscribe("", None).await.unwrap();
    let id = Uuid::new_v4();
    let shipped = Event::new("Shipped", "order", id, 1).with_data(Shipped {
        carrier: "post".to_string(),
    });
    store.save("", vec![shipped], 0).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.stream_id, Some(id));
    assert_eq!(err.version, Some(1));
    assert!(matches!(err.kind, ErrorKind::Serialization { .. }));
}

#[tokio::test]
async fn test_subscription_survives_clear() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let mut subscription = store.subscribe("", None).await.unwrap();
    let id = Uuid::new_v4();
    store.save("", batch(id, 1..=1), 0).await.unwrap();
    assert_eq!(next(&mut subscription).await.event.version(), 1);

    store.clear("").await.unwrap();
    let fresh = Uuid::new_v4();
    store.save("", batch(fresh, 1..=1), 0).await.unwrap();

    let tailed = next(&mut subscription).await;
    assert_eq!(tailed.event.stream_id(), fresh);
    assert_eq!(tailed.event.position(), Some(1));
}

#[tokio::test]
async fn test_subscription_is_scoped_to_namespace() {
    let db = MemoryDatabase::new();
    let store = open(&db, options().with_namespace("tenant")).await;
    let mut subscription = store.subscribe("tenant", None).await.unwrap();
    let id = Uuid::new_v4();

    store.save("", batch(id, 1..=1), 0).await.unwrap();
    store.save("tenant", batch(id, 1..=1), 0).await.unwrap();

    let tailed = next(&mut subscription).await;
    assert_eq!(tailed.event.stream_id(), id);
    // Each namespace has its own counter.
    assert_eq!(tailed.event.position(), Some(1));
    assert_eq!(store.global_position("tenant").await.unwrap(), 1);
}

#[tokio::test]
async fn test_close_stops_subscriptions() {
    let db = MemoryDatabase::new();
    let store = open(&db, options()).await;
    let mut subscription = store.subscribe("", None).await.unwrap();

    store.close().await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
    assert!(store.ping().await.is_err());
}
