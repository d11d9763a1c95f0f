//! Behavior tests for both dedup store implementations.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use timepost_core::{
    time::epoch_clock, Clock, DedupStore, EventId, InMemoryDedupStore, LocalStatus, Outcome,
    SqliteDedupStore, TestClock,
};

async fn stores(clock: &TestClock) -> Vec<(&'static str, Arc<dyn DedupStore>)> {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let sqlite = SqliteDedupStore::in_memory(clock.clone()).await.expect("sqlite store");
    vec![("memory", Arc::new(InMemoryDedupStore::new(clock))), ("sqlite", Arc::new(sqlite))]
}

fn id(raw: &str) -> EventId {
    EventId::from(raw)
}

#[tokio::test]
async fn lookup_of_unknown_id_is_none() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        assert!(store.lookup(id("missing")).await.expect(name).is_none(), "{name}");
    }
}

#[tokio::test]
async fn in_progress_then_outcome() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        assert!(store.mark_in_progress(id("e1")).await.expect(name), "{name}");
        let record = store.lookup(id("e1")).await.expect(name).expect("record");
        assert_eq!(record.status, LocalStatus::InProgress, "{name}");
        assert!(!record.sent, "{name}");

        clock.advance(Duration::from_secs(1));
        let applied =
            store.record_outcome(id("e1"), Outcome::success_with_id("tl-9")).await.expect(name);
        assert!(applied, "{name}");

        let record = store.lookup(id("e1")).await.expect(name).expect("record");
        assert_eq!(record.status, LocalStatus::Success, "{name}");
        assert_eq!(record.resolved_outcome(), Some(Outcome::success_with_id("tl-9")), "{name}");
        assert!(record.updated_at > record.created_at, "{name}");
    }
}

#[tokio::test]
async fn terminal_status_is_never_overwritten() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        store.mark_in_progress(id("e1")).await.expect(name);
        assert!(store.record_outcome(id("e1"), Outcome::permanent("bad")).await.expect(name));

        assert!(!store.mark_in_progress(id("e1")).await.expect(name), "{name}");
        assert!(!store.record_outcome(id("e1"), Outcome::success()).await.expect(name), "{name}");
        assert!(
            !store.upsert(id("e1"), LocalStatus::TransientFailure, None).await.expect(name),
            "{name}"
        );

        let record = store.lookup(id("e1")).await.expect(name).expect("record");
        assert_eq!(record.status, LocalStatus::PermanentFailure, "{name}");
        assert_eq!(record.message.as_deref(), Some("bad"), "{name}");
    }
}

#[tokio::test]
async fn upsert_without_outcome_still_reports() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        store.upsert(id("e1"), LocalStatus::TransientFailure, Some("later".into())).await.expect(name);
        let pending = store.pending_status_reports().await.expect(name);
        assert_eq!(pending, vec![(id("e1"), Outcome::transient("later"))], "{name}");
    }
}

#[tokio::test]
async fn pending_reports_skip_in_progress_and_sent() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        store.mark_in_progress(id("a")).await.expect(name);
        store.record_outcome(id("b"), Outcome::success()).await.expect(name);
        clock.advance(Duration::from_secs(1));
        store.record_outcome(id("c"), Outcome::transient("retry")).await.expect(name);
        clock.advance(Duration::from_secs(1));
        store.record_outcome(id("d"), Outcome::permanent("no")).await.expect(name);
        assert!(store.mark_sent(id("d")).await.expect(name));

        let pending: Vec<EventId> =
            store.pending_status_reports().await.expect(name).into_iter().map(|(i, _)| i).collect();
        assert_eq!(pending, vec![id("b"), id("c")], "{name}");
    }
}

#[tokio::test]
async fn mark_sent_requires_terminal_record() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        assert!(!store.mark_sent(id("missing")).await.expect(name), "{name}");

        store.mark_in_progress(id("e1")).await.expect(name);
        assert!(!store.mark_sent(id("e1")).await.expect(name), "{name}");

        store.record_outcome(id("e1"), Outcome::success()).await.expect(name);
        assert!(store.mark_sent(id("e1")).await.expect(name), "{name}");
        assert!(store.mark_sent(id("e1")).await.expect(name), "{name}");
        assert!(store.lookup(id("e1")).await.expect(name).expect("record").sent, "{name}");
    }
}

#[tokio::test]
async fn purge_removes_only_old_sent_records() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        store.record_outcome(id("old-sent"), Outcome::success()).await.expect(name);
        store.mark_sent(id("old-sent")).await.expect(name);
        store.record_outcome(id("old-unsent"), Outcome::success()).await.expect(name);
        store.mark_in_progress(id("old-running")).await.expect(name);

        clock.advance(Duration::from_secs(3 * 86_400));
        let cutoff = clock.now_utc() - chrono::Duration::days(1);
        store.record_outcome(id("new-sent"), Outcome::success()).await.expect(name);
        store.mark_sent(id("new-sent")).await.expect(name);

        assert_eq!(store.purge_sent_before(cutoff).await.expect(name), 1, "{name}");
        assert!(store.lookup(id("old-sent")).await.expect(name).is_none(), "{name}");
        assert!(store.lookup(id("old-unsent")).await.expect(name).is_some(), "{name}");
        assert!(store.lookup(id("old-running")).await.expect(name).is_some(), "{name}");
        assert!(store.lookup(id("new-sent")).await.expect(name).is_some(), "{name}");
    }
}

#[tokio::test]
async fn health_check_succeeds() {
    let clock = epoch_clock();
    for (name, store) in stores(&clock).await {
        store.health_check().await.expect(name);
    }
}

#[tokio::test]
async fn injected_failure_propagates() {
    let store = InMemoryDedupStore::new(Arc::new(TestClock::new()));
    store.inject_failure("disk full").await;

    let err = store.lookup(id("e1")).await.expect_err("failure");
    assert!(err.to_string().contains("disk full"));
    assert!(store.health_check().await.is_err());

    store.clear_failure().await;
    assert!(store.mark_in_progress(id("e1")).await.expect("write"));
}

#[tokio::test]
async fn concurrent_resolutions_have_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("dedup.db").display());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let store = Arc::new(SqliteDedupStore::connect(&url, 4, clock).await.expect("connect"));

    store.mark_in_progress(id("e1")).await.expect("in progress");

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let outcome = if i % 2 == 0 {
                Outcome::success_with_id(format!("x{i}"))
            } else {
                Outcome::permanent(format!("p{i}"))
            };
            store.record_outcome(id("e1"), outcome).await.expect("write")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let record = store.lookup(id("e1")).await.expect("lookup").expect("record");
    assert!(record.is_terminal());
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("dedup.db").display());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());

    {
        let store = SqliteDedupStore::connect(&url, 1, clock.clone()).await.expect("connect");
        store.record_outcome(id("e1"), Outcome::transient("timeout")).await.expect("write");
        store.pool().close().await;
    }

    let store = SqliteDedupStore::connect(&url, 1, clock).await.expect("reconnect");
    let pending = store.pending_status_reports().await.expect("pending");
    assert_eq!(pending, vec![(id("e1"), Outcome::transient("timeout"))]);
}
