//! EventStore interface tests.
//!
//! These tests verify the contract of the EventStore and
//! EventStoreMaintenance traits. Every test takes the namespace to write in,
//! so a shared database can host several runs side by side.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventline::store::BatchViolation;
use eventline::{ErrorKind, Event, EventStoreMaintenance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
}

/// Payload type deliberately left out of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unlisted {
    pub note: String,
}

eventline::register_event!(OrderPlaced, "OrderPlaced");
eventline::register_event!(ItemAdded, "ItemAdded");

pub fn placed(stream_id: Uuid, version: u64, total: i64) -> Event {
    Event::new("OrderPlaced", "order", stream_id, version).with_data(OrderPlaced { total })
}

pub fn item(stream_id: Uuid, version: u64, sku: &str) -> Event {
    Event::new("ItemAdded", "order", stream_id, version).with_data(ItemAdded {
        sku: sku.to_string(),
    })
}

/// Create sequential ItemAdded events.
pub fn items(stream_id: Uuid, versions: RangeInclusive<u64>) -> Vec<Event> {
    versions
        .map(|v| item(stream_id, v, &format!("sku-{v}")))
        .collect()
}

fn versions(events: &[Event]) -> Vec<u64> {
    events.iter().map(Event::version).collect()
}

// =============================================================================
// save / load
// =============================================================================

pub async fn test_concrete_scenario<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();

    store
        .save(ns, vec![placed(id, 1, 10), item(id, 2, "A-1")], 0)
        .await
        .expect("first save should succeed");

    let events = store.load(ns, id).await.expect("load should succeed");
    assert_eq!(versions(&events), vec![1, 2]);
    assert_eq!(events[0].event_type(), "OrderPlaced");
    assert_eq!(
        events[0].data_as::<OrderPlaced>(),
        Some(&OrderPlaced { total: 10 })
    );
    assert_eq!(events[1].data_as::<ItemAdded>().map(|i| i.sku.as_str()), Some("A-1"));

    let err = store
        .save(ns, vec![item(id, 2, "late")], 0)
        .await
        .expect_err("stale expectation should fail");
    assert!(err.is_version_conflict(), "expected conflict, got {err}");
    assert_eq!(err.stream_id, Some(id));
}

pub async fn test_version_contiguity<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();

    store.save(ns, items(id, 1..=2), 0).await.expect("batch 1");
    store.save(ns, items(id, 3..=3), 2).await.expect("batch 2");
    store.save(ns, items(id, 4..=6), 3).await.expect("batch 3");

    let events = store.load(ns, id).await.expect("load should succeed");
    assert_eq!(versions(&events), (1..=6).collect::<Vec<_>>());
    for event in &events {
        let sku = &event.data_as::<ItemAdded>().expect("payload").sku;
        assert_eq!(sku, &format!("sku-{}", event.version()));
        assert_eq!(event.stream_id(), id);
        assert_eq!(event.stream_type(), "order");
    }
}

pub async fn test_concurrent_saves_one_wins<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    store.save(ns, items(id, 1..=1), 0).await.expect("seed");

    let (first, second) = tokio::join!(
        store.save(ns, items(id, 2..=3), 1),
        store.save(ns, items(id, 2..=2), 1),
    );

    let expected_version = match (&first, &second) {
        (Ok(()), Err(e)) => {
            assert!(e.is_version_conflict(), "loser should conflict, got {e}");
            3
        }
        (Err(e), Ok(())) => {
            assert!(e.is_version_conflict(), "loser should conflict, got {e}");
            2
        }
        _ => panic!("exactly one writer must win: {first:?} / {second:?}"),
    };

    let info = store.stream_info(ns, id).await.expect("stream info");
    assert_eq!(info.version, expected_version);
    let events = store.load(ns, id).await.expect("load");
    assert_eq!(versions(&events), (1..=expected_version).collect::<Vec<_>>());
}

pub async fn test_invalid_batches_rejected<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    let violation = |result: eventline::store::Result<()>| match result {
        Err(e) => match e.kind {
            ErrorKind::InvalidBatch(v) => v,
            other => panic!("expected invalid batch, got {other}"),
        },
        Ok(()) => panic!("invalid batch was accepted"),
    };

    assert_eq!(violation(store.save(ns, vec![], 0).await), BatchViolation::Empty);
    assert_eq!(
        violation(
            store
                .save(ns, vec![item(id, 1, "a"), item(Uuid::new_v4(), 2, "b")], 0)
                .await
        ),
        BatchViolation::MismatchedStreamIds
    );
    assert_eq!(
        violation(
            store
                .save(
                    ns,
                    vec![item(id, 1, "a"), Event::new("ItemAdded", "cart", id, 2)],
                    0
                )
                .await
        ),
        BatchViolation::MismatchedStreamTypes
    );
    assert!(matches!(
        violation(store.save(ns, vec![item(id, 1, "a"), item(id, 3, "c")], 0).await),
        BatchViolation::NonContiguousVersions {
            expected: 2,
            actual: 3
        }
    ));

    // Nothing was written.
    let err = store.load(ns, id).await.expect_err("stream should not exist");
    assert!(err.is_not_found());
}

pub async fn test_load_from_version<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    store.save(ns, items(id, 1..=5), 0).await.expect("save");

    let tail = store.load_from(ns, id, 4).await.expect("load_from");
    assert_eq!(versions(&tail), vec![4, 5]);

    let none = store.load_from(ns, id, 6).await.expect("load_from past end");
    assert!(none.is_empty());
}

pub async fn test_load_unknown_stream<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    let err = store.load(ns, id).await.expect_err("unknown stream");
    assert!(matches!(err.kind, ErrorKind::StreamNotFound));
    assert_eq!(err.stream_id, Some(id));

    let err = store.stream_info(ns, id).await.expect_err("unknown stream");
    assert!(err.is_not_found());
}

pub async fn test_stream_info<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    store.save(ns, items(id, 1..=2), 0).await.expect("save");
    store.save(ns, items(id, 3..=3), 2).await.expect("save");

    let info = store.stream_info(ns, id).await.expect("stream info");
    assert_eq!(info.stream_id, id);
    assert_eq!(info.stream_type, "order");
    assert_eq!(info.version, 3);
    assert!(info.updated_at.is_some());
}

pub async fn test_unregistered_payload_fails_decode<S: EventStoreMaintenance>(
    store: &S,
    ns: &str,
) {
    let id = Uuid::new_v4();
    store.save(ns, vec![placed(id, 1, 10)], 0).await.expect("save");
    let event = Event::new("Unlisted", "order", id, 2).with_data(Unlisted {
        note: "kept on disk".to_string(),
    });
    store.save(ns, vec![event], 1).await.expect("save");

    let err = store.load(ns, id).await.expect_err("decode should fail");
    assert_eq!(err.stream_id, Some(id));
    assert_eq!(err.version, Some(2), "error should name the undecodable event");
    match err.kind {
        ErrorKind::Serialization { event_type, .. } => assert_eq!(event_type, "Unlisted"),
        other => panic!("expected serialization error, got {other}"),
    }
}

pub async fn test_namespaces_isolated<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let other = format!("{ns}_other");
    let id = Uuid::new_v4();

    store.save(ns, items(id, 1..=2), 0).await.expect("save");
    store.save(&other, items(id, 1..=1), 0).await.expect("save other");

    assert_eq!(store.load(ns, id).await.expect("load").len(), 2);
    assert_eq!(store.load(&other, id).await.expect("load other").len(), 1);

    store.clear(&other).await.expect("clear other");
}

// =============================================================================
// maintenance
// =============================================================================

pub async fn test_replace_changes_only_payload<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    store
        .save(
            ns,
            vec![placed(id, 1, 10), placed(id, 2, 20), placed(id, 3, 30)],
            0,
        )
        .await
        .expect("save");
    let before = store.load(ns, id).await.expect("load");

    store
        .replace(ns, placed(id, 3, 31))
        .await
        .expect("replace should succeed");

    let after = store.load(ns, id).await.expect("load");
    assert_eq!(versions(&after), vec![1, 2, 3]);
    assert_eq!(after[0].data_as::<OrderPlaced>(), before[0].data_as::<OrderPlaced>());
    assert_eq!(after[1].data_as::<OrderPlaced>(), before[1].data_as::<OrderPlaced>());
    assert_eq!(after[2].data_as::<OrderPlaced>(), Some(&OrderPlaced { total: 31 }));
    assert_eq!(after[2].position(), before[2].position());
    assert_eq!(store.stream_info(ns, id).await.expect("info").version, 3);
}

pub async fn test_replace_missing<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    let err = store
        .replace(ns, placed(id, 1, 1))
        .await
        .expect_err("no stream");
    assert!(matches!(err.kind, ErrorKind::StreamNotFound));

    store.save(ns, vec![placed(id, 1, 1)], 0).await.expect("save");
    let err = store
        .replace(ns, placed(id, 2, 2))
        .await
        .expect_err("no event");
    assert!(matches!(err.kind, ErrorKind::EventNotFound));
}

pub async fn test_rename_event<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    let old_type = format!("Legacy{}", id.simple());
    let new_type = format!("Current{}", id.simple());
    store
        .save(
            ns,
            vec![
                Event::new(old_type.as_str(), "order", id, 1),
                item(id, 2, "kept"),
                Event::new(old_type.as_str(), "order", id, 3),
            ],
            0,
        )
        .await
        .expect("save");

    store
        .rename_event(ns, &old_type, &new_type)
        .await
        .expect("rename");

    let types: Vec<String> = store
        .load(ns, id)
        .await
        .expect("load")
        .iter()
        .map(|e| e.event_type().to_string())
        .collect();
    assert_eq!(types, vec![new_type.clone(), "ItemAdded".to_string(), new_type]);
}

pub async fn test_remove_stream<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let id = Uuid::new_v4();
    let kept = Uuid::new_v4();
    store.save(ns, items(id, 1..=3), 0).await.expect("save");
    store.save(ns, items(kept, 1..=1), 0).await.expect("save kept");

    store.remove(ns, id).await.expect("remove");

    assert!(store.load(ns, id).await.expect_err("removed").is_not_found());
    assert!(store.stream_info(ns, id).await.expect_err("removed").is_not_found());
    assert_eq!(store.load(ns, kept).await.expect("kept").len(), 1);

    store.remove(ns, id).await.expect("second remove is a no-op");
    // The id is free again.
    store.save(ns, items(id, 1..=1), 0).await.expect("recreate");
}

pub async fn test_clear_namespace<S: EventStoreMaintenance>(store: &S, ns: &str) {
    let scratch = format!("{ns}_scratch");
    let id = Uuid::new_v4();
    store.save(&scratch, items(id, 1..=2), 0).await.expect("save");

    store.clear(&scratch).await.expect("clear");

    assert!(store.load(&scratch, id).await.expect_err("cleared").is_not_found());
    store.save(&scratch, items(id, 1..=1), 0).await.expect("reuse");
    store.clear(&scratch).await.expect("clear again");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all EventStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_event_store_tests {
    ($store:expr, $ns:expr) => {
        use $crate::store::event_store_tests::*;

        // save / load
        test_concrete_scenario($store, $ns).await;
        println!("  test_concrete_scenario: PASSED");

        test_version_contiguity($store, $ns).await;
        println!("  test_version_contiguity: PASSED");

        test_concurrent_saves_one_wins($store, $ns).await;
        println!("  test_concurrent_saves_one_wins: PASSED");

        test_invalid_batches_rejected($store, $ns).await;
        println!("  test_invalid_batches_rejected: PASSED");

        test_load_from_version($store, $ns).await;
        println!("  test_load_from_version: PASSED");

        test_load_unknown_stream($store, $ns).await;
        println!("  test_load_unknown_stream: PASSED");

        test_stream_info($store, $ns).await;
        println!("  test_stream_info: PASSED");

        test_unregistered_payload_fails_decode($store, $ns).await;
        println!("  test_unregistered_payload_fails_decode: PASSED");

        test_namespaces_isolated($store, $ns).await;
        println!("  test_namespaces_isolated: PASSED");

        // maintenance
        test_replace_changes_only_payload($store, $ns).await;
        println!("  test_replace_changes_only_payload: PASSED");

        test_replace_missing($store, $ns).await;
        println!("  test_replace_missing: PASSED");

        test_rename_event($store, $ns).await;
        println!("  test_rename_event: PASSED");

        test_remove_stream($store, $ns).await;
        println!("  test_remove_stream: PASSED");

        test_clear_namespace($store, $ns).await;
        println!("  test_clear_namespace: PASSED");
    };
}
