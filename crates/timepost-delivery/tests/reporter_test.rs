//! Status reporter tests: background reports and sweep convergence.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use proptest::prelude::*;
use timepost_core::{DedupStore, EventId, Outcome};
use timepost_delivery::{DeliveryError, RemoteStatus};
use timepost_testing::TestEnv;

const WAIT: Duration = Duration::from_secs(5);

async fn resolve(env: &TestEnv, id: &str, outcome: Outcome) {
    assert!(env.store.mark_in_progress(EventId::from(id)).await.unwrap());
    assert!(env.store.record_outcome(EventId::from(id), outcome).await.unwrap());
}

fn outcome_for(i: usize) -> Outcome {
    match i % 3 {
        0 => Outcome::success_with_id(format!("ts-{i}")),
        1 => Outcome::transient("calendar offline"),
        _ => Outcome::permanent("user unknown"),
    }
}

#[tokio::test]
async fn report_now_marks_record_sent() {
    let env = TestEnv::new().await.unwrap();
    resolve(&env, "E1", Outcome::success_with_id("ts-1")).await;

    env.reporter.report_now(EventId::from("E1"), Outcome::success_with_id("ts-1"));
    let record = env.wait_for_sent("E1", WAIT).await.unwrap();

    assert!(record.sent);
    let reports = env.remote.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RemoteStatus::Success);
    assert_eq!(reports[0].external_id.as_deref(), Some("ts-1"));
    assert_eq!(env.stats.read().await.reports_sent, 1);
}

#[tokio::test]
async fn failed_reports_are_picked_up_by_the_next_sweep() {
    let env = TestEnv::new().await.unwrap();
    for i in 0..5 {
        resolve(&env, &format!("E{i}"), outcome_for(i)).await;
    }
    env.remote.fail_next_reports_with(2, DeliveryError::network("connection reset"));

    let first = env.reporter.sweep().await.unwrap();
    assert_eq!((first.pending, first.reported, first.failed), (5, 3, 2));
    assert_eq!(env.store.pending_status_reports().await.unwrap().len(), 2);

    let second = env.reporter.sweep().await.unwrap();
    assert_eq!((second.pending, second.reported, second.failed), (2, 2, 0));
    assert!(env.store.pending_status_reports().await.unwrap().is_empty());
    assert_eq!(env.stats.read().await.reports_failed, 2);
}

#[tokio::test]
async fn sweep_skips_records_still_in_progress() {
    let env = TestEnv::new().await.unwrap();
    env.store.mark_in_progress(EventId::from("busy")).await.unwrap();
    resolve(&env, "done", Outcome::permanent("duplicate entry")).await;

    let summary = env.reporter.sweep().await.unwrap();

    assert_eq!(summary.pending, 1);
    assert_eq!(env.remote.last_status(&EventId::from("done")), Some(RemoteStatus::Failure));
    assert!(env.remote.reports_for(&EventId::from("busy")).is_empty());
}

#[tokio::test]
async fn sweep_propagates_store_failures() {
    let env = TestEnv::new().await.unwrap();
    env.store.pool().close().await;

    assert!(env.reporter.sweep().await.is_err());
}

#[tokio::test]
async fn report_now_after_shutdown_leaves_record_pending() {
    let env = TestEnv::new().await.unwrap();
    resolve(&env, "late", Outcome::success()).await;

    assert!(env.reporter.shutdown(WAIT).await);
    env.reporter.report_now(EventId::from("late"), Outcome::success());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(env.remote.reports().is_empty());
    assert_eq!(env.store.pending_status_reports().await.unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn clean_sweep_marks_every_resolved_record_sent(count in 0usize..40) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let env = TestEnv::new().await.unwrap();
            for i in 0..count {
                resolve(&env, &format!("evt-{i}"), outcome_for(i)).await;
            }

            let summary = env.reporter.sweep().await.unwrap();

            assert_eq!(summary.pending, count);
            assert_eq!(summary.reported, count);
            assert!(env.store.pending_status_reports().await.unwrap().is_empty());
            for i in 0..count {
                let record = env.record(&format!("evt-{i}")).await.unwrap().unwrap();
                assert!(record.sent);
            }
        });
    }
}
