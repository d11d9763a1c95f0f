//! Controller lifecycle tests: runners, health-driven stop and shutdown
//! draining.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use timepost::{Components, Controller, ControllerConfig, LifecycleState, RetentionPolicy, Schedule};
use timepost_core::{CoreError, DedupStore, Event, EventId, Handler, Outcome, RealClock, Transport};
use timepost_testing::{time_event, TestEnv};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ControllerConfig {
    let every = Schedule::new(Duration::from_millis(10), Duration::from_millis(20));
    ControllerConfig {
        status_sweep: every,
        sync: every,
        slow_sync: every,
        retention: None,
        health_check_interval: Duration::from_millis(20),
        unhealthy_threshold: Duration::from_secs(60),
        shutdown_timeout: WAIT,
    }
}

struct Harness {
    controller: Arc<Controller>,
    halted: Arc<AtomicBool>,
}

impl Harness {
    fn new(env: &TestEnv, config: ControllerConfig, transport: Option<Arc<dyn Transport>>) -> Self {
        Self::with_handler(env, config, env.handler.clone(), transport)
    }

    fn with_handler(
        env: &TestEnv,
        config: ControllerConfig,
        handler: Arc<dyn Handler>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        let halted = Arc::new(AtomicBool::new(false));
        let flag = halted.clone();
        let controller = Controller::new(
            config,
            Components {
                handler,
                store: env.store.clone(),
                reporter: env.reporter.clone(),
                transport,
                clock: Arc::new(RealClock::new()),
            },
        )
        .with_halt_hook(Arc::new(move |_| flag.store(true, Ordering::SeqCst)));
        Self { controller: Arc::new(controller), halted }
    }

    fn spawn_start(&self) -> JoinHandle<anyhow::Result<()>> {
        let controller = self.controller.clone();
        tokio::spawn(async move { controller.start().await })
    }

    async fn wait_for_state(&self, state: LifecycleState) {
        tokio::time::timeout(WAIT, async {
            while self.controller.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("controller never reached {state:?}"));
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn resolve(env: &TestEnv, id: &str, outcome: Outcome) {
    assert!(env.store.mark_in_progress(EventId::from(id)).await.unwrap());
    assert!(env.store.record_outcome(EventId::from(id), outcome).await.unwrap());
}

/// Transport whose liveness the test controls.
#[derive(Default)]
struct SwitchTransport {
    running: AtomicBool,
}

#[async_trait]
impl Transport for SwitchTransport {
    fn name(&self) -> &str {
        "switch"
    }

    async fn start(&self) -> timepost_core::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self, _timeout: Duration) -> timepost_core::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.is_running()
    }
}

/// Transport that cannot bind.
struct UnbindableTransport;

#[async_trait]
impl Transport for UnbindableTransport {
    fn name(&self) -> &str {
        "unbindable"
    }

    async fn start(&self) -> timepost_core::Result<()> {
        Err(CoreError::transport("address already in use"))
    }

    fn is_running(&self) -> bool {
        false
    }

    async fn stop(&self, _timeout: Duration) -> timepost_core::Result<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        false
    }
}

/// Transport whose drain always uses up the whole budget it is given.
struct SlowDrainTransport;

#[async_trait]
impl Transport for SlowDrainTransport {
    fn name(&self) -> &str {
        "slow-drain"
    }

    async fn start(&self) -> timepost_core::Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn stop(&self, timeout: Duration) -> timepost_core::Result<()> {
        tokio::time::sleep(timeout).await;
        Err(CoreError::ShutdownTimeout { timeout })
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Handler whose periodic sync never returns.
#[derive(Debug, Default)]
struct StuckSyncHandler {
    syncing: AtomicBool,
}

#[async_trait]
impl Handler for StuckSyncHandler {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        Ok(Outcome::success())
    }

    async fn sync(&self) -> anyhow::Result<()> {
        self.syncing.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_hooks_run_in_lifecycle_order() {
    let env = TestEnv::new().await.unwrap();
    let harness = Harness::new(&env, fast_config(), None);
    assert_eq!(harness.controller.state(), LifecycleState::Created);
    assert_eq!(harness.controller.runner_names(), vec!["status-report-sweep", "sync", "slow-sync"]);

    let started = harness.spawn_start();
    harness.wait_for_state(LifecycleState::Running).await;
    wait_until("both syncs", || {
        let lifecycle = env.handler.lifecycle();
        lifecycle.contains(&"sync") && lifecycle.contains(&"slow_sync")
    })
    .await;

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    harness.controller.stop().await;

    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
    let lifecycle = env.handler.lifecycle();
    assert_eq!(lifecycle.first(), Some(&"init"));
    assert_eq!(lifecycle.last(), Some(&"shutdown"));
    assert_eq!(lifecycle.iter().filter(|hook| **hook == "init").count(), 1);
    assert!(!harness.halted.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_while_running_is_ignored() {
    let env = TestEnv::new().await.unwrap();
    let harness = Harness::new(&env, fast_config(), None);

    let started = harness.spawn_start();
    harness.wait_for_state(LifecycleState::Running).await;

    tokio::time::timeout(WAIT, harness.controller.start())
        .await
        .expect("second start returns immediately")
        .unwrap();
    assert_eq!(harness.controller.state(), LifecycleState::Running);

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    harness.controller.stop().await;

    assert_eq!(env.handler.lifecycle().iter().filter(|hook| **hook == "init").count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_controller_cannot_restart() {
    let env = TestEnv::new().await.unwrap();
    let harness = Harness::new(&env, fast_config(), None);

    harness.controller.stop().await;
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
    assert!(env.handler.lifecycle().is_empty());

    assert!(harness.controller.start().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_runner_reports_pending_records() {
    let env = TestEnv::new().await.unwrap();
    resolve(&env, "E1", Outcome::success_with_id("ts-1")).await;
    resolve(&env, "E2", Outcome::permanent("user unknown")).await;
    let harness = Harness::new(&env, fast_config(), None);

    let started = harness.spawn_start();
    env.wait_for_sent("E1", WAIT).await.unwrap();
    env.wait_for_sent("E2", WAIT).await.unwrap();

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    harness.controller.stop().await;
    assert!(env.store.pending_status_reports().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retention_runner_purges_old_reported_records() {
    let env = TestEnv::new().await.unwrap();
    resolve(&env, "old", Outcome::success()).await;
    env.store.mark_sent(EventId::from("old")).await.unwrap();
    env.clock.advance(Duration::from_secs(7200));
    resolve(&env, "fresh", Outcome::success()).await;
    env.store.mark_sent(EventId::from("fresh")).await.unwrap();

    let config = ControllerConfig {
        retention: Some(RetentionPolicy {
            max_age: Duration::from_millis(1),
            schedule: Schedule::new(Duration::from_millis(20), Duration::from_millis(20)),
        }),
        ..fast_config()
    };
    let harness = Harness::new(&env, config, None);
    assert!(harness.controller.runner_names().contains(&"retention".to_string()));

    let started = harness.spawn_start();
    tokio::time::timeout(WAIT, async {
        while env.record("old").await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old record purged");

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    harness.controller.stop().await;
    assert!(env.record("fresh").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sustained_unhealthiness_stops_the_controller() {
    let env = TestEnv::new().await.unwrap();
    env.handler.fail_syncs(true);
    let config =
        ControllerConfig { unhealthy_threshold: Duration::from_millis(100), ..fast_config() };
    let harness = Harness::new(&env, config, None);

    let started = harness.spawn_start();

    tokio::time::timeout(WAIT, started)
        .await
        .expect("unhealthy controller stops itself")
        .unwrap()
        .unwrap();
    assert!(!harness.controller.health().is_healthy().await);

    harness.controller.stop().await;
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
    assert!(!harness.halted.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_that_dies_ends_start() {
    let env = TestEnv::new().await.unwrap();
    let transport = Arc::new(SwitchTransport::default());
    let harness = Harness::new(&env, fast_config(), Some(transport.clone() as Arc<dyn Transport>));

    let started = harness.spawn_start();
    harness.wait_for_state(LifecycleState::Running).await;
    assert!(transport.is_running());

    transport.running.store(false, Ordering::SeqCst);

    tokio::time::timeout(WAIT, started).await.expect("start returns").unwrap().unwrap();
    harness.controller.stop().await;
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undrained_handler_triggers_halt() {
    let env = TestEnv::new().await.unwrap();
    env.handler.close_gate();
    env.remote.push_batch(vec![time_event("E9")]);
    let transport: Arc<dyn Transport> =
        Arc::new(env.fetch_client(TestEnv::fast_fetch_config()).unwrap());
    let config = ControllerConfig { shutdown_timeout: Duration::from_millis(100), ..fast_config() };
    let harness = Harness::new(&env, config, Some(transport));

    let started = harness.spawn_start();
    env.handler.wait_for_invocations(1, WAIT).await.unwrap();

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    harness.controller.stop().await;

    assert!(harness.halted.load(Ordering::SeqCst));
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
    env.handler.release(1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_transport_start_releases_handler() {
    let env = TestEnv::new().await.unwrap();
    let harness =
        Harness::new(&env, fast_config(), Some(Arc::new(UnbindableTransport) as Arc<dyn Transport>));

    let err = harness.controller.start().await.expect_err("transport cannot bind");
    assert!(format!("{err:#}").contains("address already in use"));
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
    assert_eq!(env.handler.lifecycle(), vec!["init", "shutdown"]);

    // The usual start-then-stop sequence does not release the handler twice.
    harness.controller.stop().await;
    assert_eq!(env.handler.lifecycle(), vec!["init", "shutdown"]);
    assert!(!harness.halted.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_timeout_bounds_the_whole_stop() {
    let env = TestEnv::new().await.unwrap();
    let handler = Arc::new(StuckSyncHandler::default());
    let timeout = Duration::from_millis(300);
    let config = ControllerConfig { shutdown_timeout: timeout, ..fast_config() };
    let harness = Harness::with_handler(
        &env,
        config,
        handler.clone(),
        Some(Arc::new(SlowDrainTransport) as Arc<dyn Transport>),
    );

    let started = harness.spawn_start();
    wait_until("a stuck sync", || handler.syncing.load(Ordering::SeqCst)).await;

    harness.controller.request_stop();
    started.await.unwrap().unwrap();
    let begun = std::time::Instant::now();
    harness.controller.stop().await;
    let elapsed = begun.elapsed();

    // Transport drain and runner drain share one budget instead of each
    // getting the full timeout.
    assert!(elapsed < timeout + Duration::from_millis(200), "stop took {elapsed:?}");
    assert!(harness.halted.load(Ordering::SeqCst));
    assert_eq!(harness.controller.state(), LifecycleState::Stopped);
}
