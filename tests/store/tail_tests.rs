//! Global order and tailing tests for the normalized layout.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use eventline::store::{EventSubscription, TailedEvent};
use eventline::{EventStore, NormalizedStore};

use super::event_store_tests::items;

pub async fn next_event(subscription: &mut EventSubscription) -> TailedEvent {
    tokio::time::timeout(Duration::from_secs(10), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
        .expect("event should decode")
}

fn positions_of(events: &[eventline::Event]) -> Vec<u64> {
    events
        .iter()
        .map(|e| e.position().expect("loaded event should carry a position"))
        .collect()
}

pub async fn test_global_order_across_streams(store: &NormalizedStore, ns: &str) {
    let start = store.global_position(ns).await.expect("global position");
    let streams: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

    for result in join_all(streams.iter().map(|id| store.save(ns, items(*id, 1..=2), 0))).await {
        result.expect("concurrent create should succeed");
    }
    for result in join_all(streams.iter().map(|id| store.save(ns, items(*id, 3..=3), 2))).await {
        result.expect("concurrent append should succeed");
    }

    let mut all = BTreeSet::new();
    for id in &streams {
        let positions = positions_of(&store.load(ns, *id).await.expect("load"));
        assert_eq!(positions.len(), 3);
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "positions must grow with version: {positions:?}"
        );
        all.extend(positions);
    }
    let expected: BTreeSet<u64> = (start + 1..=start + 12).collect();
    assert_eq!(all, expected, "positions must be distinct and gap-free");
    assert_eq!(store.global_position(ns).await.expect("global"), start + 12);

    // A save that starts after the others committed sorts after all of them.
    let later = Uuid::new_v4();
    store.save(ns, items(later, 1..=1), 0).await.expect("later save");
    let position = positions_of(&store.load(ns, later).await.expect("load"))[0];
    assert!(all.iter().all(|p| *p < position));
}

pub async fn test_tail_delivers_committed_events(store: &NormalizedStore, ns: &str) {
    let mut subscription = store.subscribe(ns, None).await.expect("subscribe");
    let id = Uuid::new_v4();

    store.save(ns, items(id, 1..=2), 0).await.expect("save");
    store.save(ns, items(id, 3..=3), 2).await.expect("save");

    let loaded = positions_of(&store.load(ns, id).await.expect("load"));
    let mut tailed = Vec::new();
    for _ in 0..3 {
        let event = next_event(&mut subscription).await;
        assert_eq!(event.event.stream_id(), id);
        tailed.push(event.event.position().expect("tailed event position"));
    }
    assert_eq!(tailed, loaded);
    subscription.stop().await;
}

pub async fn test_tail_resumes_from_token(store: &NormalizedStore, ns: &str) {
    let mut subscription = store.subscribe(ns, None).await.expect("subscribe");
    let id = Uuid::new_v4();

    store.save(ns, items(id, 1..=1), 0).await.expect("save");
    store.save(ns, items(id, 2..=2), 1).await.expect("save");
    let first = next_event(&mut subscription).await;
    let second = next_event(&mut subscription).await;
    assert_eq!(second.event.version(), 2);
    subscription.stop().await;

    // Committed while nobody was listening.
    store.save(ns, items(id, 3..=3), 2).await.expect("save");

    let mut resumed = store
        .subscribe(ns, Some(first.token))
        .await
        .expect("resume");
    assert_eq!(next_event(&mut resumed).await.event.version(), 2);
    assert_eq!(next_event(&mut resumed).await.event.version(), 3);
    resumed.stop().await;
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run the global order and tailing tests against a normalized store.
#[macro_export]
macro_rules! run_tail_tests {
    ($store:expr, $ns:expr) => {
        use $crate::store::tail_tests::*;

        test_global_order_across_streams($store, $ns).await;
        println!("  test_global_order_across_streams: PASSED");

        test_tail_delivers_committed_events($store, $ns).await;
        println!("  test_tail_delivers_committed_events: PASSED");

        test_tail_resumes_from_token($store, $ns).await;
        println!("  test_tail_resumes_from_token: PASSED");
    };
}
