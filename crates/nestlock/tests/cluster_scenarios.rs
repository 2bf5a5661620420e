//! Scenarios across a coordinator and workers on the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use nestlock::Coordinator;
use nestlock::CoordinatorEvent;
use nestlock::CoordinatorHandle;
use nestlock::CoordinatorTransport;
use nestlock::MemoryNetwork;
use nestlock::MutexConfig;
use nestlock::MutexError;
use nestlock::MutexExecutor;
use nestlock::MutexMessage;
use nestlock::WorkerSynchronizer;
use nestlock::WorkerTransport;
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(2);
const SETTLE: Duration = Duration::from_secs(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("nestlock=debug").with_test_writer().try_init();
}

async fn start(config: MutexConfig) -> (MemoryNetwork, CoordinatorHandle) {
    let network = MemoryNetwork::new();
    let handle = Coordinator::new(config).start(Arc::new(network.coordinator())).await.unwrap();
    (network, handle)
}

async fn worker_executor(network: &MemoryNetwork, config: MutexConfig) -> MutexExecutor {
    let synchronizer = WorkerSynchronizer::connect(Arc::new(network.spawn_worker()), config).await.unwrap();
    MutexExecutor::new(Arc::new(synchronizer))
}

fn overlaps(a: (Instant, Instant), b: (Instant, Instant)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

async fn timed_hold(executor: MutexExecutor, key: &'static str, hold: Duration) -> (Instant, Instant) {
    executor
        .lock_single_access(key, None, || async {
            let start = Instant::now();
            tokio::time::sleep(hold).await;
            Ok::<_, MutexError>((start, Instant::now()))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_workers_exclude_each_other() {
    init_tracing();
    let (network, handle) = start(MutexConfig::default()).await;
    let first = worker_executor(&network, MutexConfig::default()).await;
    let second = worker_executor(&network, MutexConfig::default()).await;
    let started = Instant::now();

    let (a, b) = tokio::join!(
        tokio::spawn(timed_hold(first.clone(), "mutex", Duration::from_millis(10))),
        tokio::spawn(timed_hold(second.clone(), "mutex", Duration::from_millis(10))),
    );

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(!overlaps(a.unwrap(), b.unwrap()));
    assert!(first.is_clear() && second.is_clear());
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_and_worker_share_one_queue() {
    let (network, handle) = start(MutexConfig::default()).await;
    let local = handle.executor();
    let remote = worker_executor(&network, MutexConfig::default()).await;

    let (a, b) = tokio::join!(
        tokio::spawn(timed_hold(local, "root", Duration::from_millis(10))),
        tokio::spawn(timed_hold(remote, "root/child", Duration::from_millis(10))),
    );

    assert!(!overlaps(a.unwrap(), b.unwrap()));
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_worker_nesting_and_lock_info() {
    let (network, handle) = start(MutexConfig::default()).await;
    let executor = worker_executor(&network, MutexConfig::default()).await;
    let inner = executor.clone();

    let parents = executor
        .lock_single_access("root", None, || async move {
            inner
                .lock_single_access("root/child", None, || async {
                    inner.watchdog("nested").await?;
                    let hash = inner.current_hash().unwrap();
                    let info = inner.get_lock_info(hash).await?.unwrap();
                    Ok::<_, MutexError>(info.parents.len())
                })
                .await
        })
        .await
        .unwrap();

    assert_eq!(parents, 1);
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_crossed_workers_surface_dead_end() {
    init_tracing();
    let (network, handle) = start(MutexConfig::default()).await;
    let first = worker_executor(&network, MutexConfig::default()).await;
    let second = worker_executor(&network, MutexConfig::default()).await;
    let barrier = Arc::new(Barrier::new(2));

    let chain = |executor: MutexExecutor, first_key: &'static str, second_key: &'static str| {
        let barrier = barrier.clone();
        async move {
            let nested = executor.clone();
            executor
                .lock_single_access(first_key, None, || async move {
                    barrier.wait().await;
                    nested.lock_single_access(second_key, None, || async { Ok::<_, MutexError>(()) }).await
                })
                .await
        }
    };

    let (a, b) = tokio::time::timeout(
        SETTLE,
        futures::future::join(tokio::spawn(chain(first, "a", "b")), tokio::spawn(chain(second, "b", "a"))),
    )
    .await
    .expect("crossed workers hung");
    let results = [a.unwrap(), b.unwrap()];

    assert_eq!(results.iter().filter(|r| matches!(r, Err(e) if e.is_dead_end())).count(), 1);
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    match err {
        MutexError::DeadEndDetected { colliding, .. } => assert_eq!(colliding.len(), 2),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_timeout_terminates_owning_worker() {
    init_tracing();
    let (network, handle) = start(MutexConfig::default()).await;
    let doomed_transport = network.spawn_worker();
    let doomed_id = doomed_transport.worker_id();
    let doomed = MutexExecutor::new(Arc::new(
        WorkerSynchronizer::connect(Arc::new(doomed_transport), MutexConfig::default()).await.unwrap(),
    ));
    let survivor = worker_executor(&network, MutexConfig::default()).await;

    let stuck = tokio::spawn(async move {
        doomed
            .lock_single_access("mutex", Some(Duration::from_millis(20)), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, MutexError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let started = Instant::now();
    survivor.lock_single_access("mutex", None, || async { Ok::<_, MutexError>(()) }).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(network.is_terminated(doomed_id));

    // The terminated worker can no longer reach the coordinator to unlock.
    let err = stuck.await.unwrap().unwrap_err();
    assert!(matches!(err, MutexError::Transport { .. }));
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_continue_on_timeout_rejects_remote_waiter() {
    let config = MutexConfig::continue_on_timeout();
    let (network, handle) = start(config.clone()).await;
    let holder = worker_executor(&network, config.clone()).await;
    let waiter = worker_executor(&network, config).await;

    let held = tokio::spawn(async move {
        holder
            .lock_single_access("mutex", None, || async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok::<_, MutexError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = waiter
        .lock_single_access("mutex", Some(Duration::from_millis(15)), || async { Ok::<_, MutexError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.descriptor().unwrap().worker, Some(nestlock::WorkerId(2)));

    held.await.unwrap().unwrap();
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_worker_exit_releases_held_locks() {
    let (network, handle) = start(MutexConfig::default()).await;
    let leaving_transport = network.spawn_worker();
    let leaving = MutexExecutor::new(Arc::new(
        WorkerSynchronizer::connect(Arc::new(leaving_transport.clone()), MutexConfig::default()).await.unwrap(),
    ));
    let staying = worker_executor(&network, MutexConfig::default()).await;

    let entered = Arc::new(Barrier::new(2));
    let entered_inside = entered.clone();
    let _abandoned = tokio::spawn(async move {
        leaving
            .lock_single_access("mutex", None, || async move {
                entered_inside.wait().await;
                std::future::pending::<Result<(), MutexError>>().await
            })
            .await
    });
    entered.wait().await;

    leaving_transport.exit();
    tokio::time::timeout(
        SETTLE,
        staying.lock_single_access("mutex", None, || async { Ok::<_, MutexError>(()) }),
    )
    .await
    .expect("lock of departed worker was not released")
    .unwrap();

    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_is_fatal() {
    let network = MemoryNetwork::new();
    let coordinator = network.coordinator();
    let mut events = coordinator.subscribe().await.unwrap();

    // A coordinator from another release answers the handshake.
    let fake = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Some(CoordinatorEvent::Message { from, .. }) = events.recv().await {
                coordinator
                    .send_to_worker(from, MutexMessage::VerifyComplete {
                        version: "0.0.0-other".to_string(),
                        uses_custom_config: false,
                    })
                    .await
                    .unwrap();
            }
        }
    });

    let err = WorkerSynchronizer::connect(Arc::new(network.spawn_worker()), MutexConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MutexError::VersionMismatch { ref remote, .. } if remote == "0.0.0-other"));
    fake.await.unwrap();
}

#[tokio::test]
async fn test_shared_workers_overlap() {
    let (network, handle) = start(MutexConfig::default()).await;
    let first = worker_executor(&network, MutexConfig::default()).await;
    let second = worker_executor(&network, MutexConfig::default()).await;
    let windows = Arc::new(Mutex::new(Vec::new()));

    let shared = |executor: MutexExecutor| {
        let windows = windows.clone();
        async move {
            executor
                .lock_multi_access("reports", None, || async {
                    let start = Instant::now();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    windows.lock().push((start, Instant::now()));
                    Ok::<_, MutexError>(())
                })
                .await
        }
    };

    let (a, b) = tokio::join!(tokio::spawn(shared(first)), tokio::spawn(shared(second)));
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let windows = windows.lock().clone();
    assert!(overlaps(windows[0], windows[1]));
    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_worker_with_longer_handshake_wait_connects() {
    let (network, handle) = start(MutexConfig::default()).await;
    let patient = MutexConfig {
        handshake_timeout_ms: 30_000,
        ..MutexConfig::default()
    };

    let executor = worker_executor(&network, patient).await;
    executor.lock_single_access("mutex", None, || async { Ok::<_, MutexError>(()) }).await.unwrap();

    assert!(handle.wait_clear(POLL, SETTLE).await);
    handle.shutdown().await;
}
