//! End-to-end scenarios through the executor on an in-process queue.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nestlock::LockDescriptor;
use nestlock::LocalSynchronizer;
use nestlock::MutexConfig;
use nestlock::MutexError;
use nestlock::MutexExecutor;
use nestlock::RequestOrigin;
use nestlock::SafeCallback;
use nestlock::TimeoutAction;
use nestlock::TimeoutHandler;
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::time::Instant;

type Intervals = Arc<Mutex<Vec<(&'static str, Instant, Instant)>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("nestlock=debug").with_test_writer().try_init();
}

/// Hold `key` for `hold`, recording when the body ran.
async fn hold(
    executor: MutexExecutor,
    key: &'static str,
    single_access: bool,
    hold: Duration,
    intervals: Intervals,
) -> Result<(), MutexError> {
    executor
        .lock_access(key, single_access, None, || async {
            let start = Instant::now();
            tokio::time::sleep(hold).await;
            intervals.lock().push((key, start, Instant::now()));
            Ok(())
        })
        .await
}

fn overlaps(a: (Instant, Instant), b: (Instant, Instant)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn interval(intervals: &Intervals, index: usize) -> (Instant, Instant) {
    let recorded = intervals.lock();
    (recorded[index].1, recorded[index].2)
}

#[tokio::test]
async fn test_exclusive_callers_do_not_overlap() {
    init_tracing();
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();
    let started = Instant::now();

    let (a, b) = tokio::join!(
        tokio::spawn(hold(executor.clone(), "mutex", true, Duration::from_millis(10), intervals.clone())),
        tokio::spawn(hold(executor.clone(), "mutex", true, Duration::from_millis(10), intervals.clone())),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(!overlaps(interval(&intervals, 0), interval(&intervals, 1)));
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_shared_overlap_exclusive_disjoint() {
    init_tracing();
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();

    let shared_a = tokio::spawn(hold(executor.clone(), "mutex", false, Duration::from_millis(30), intervals.clone()));
    let shared_b = tokio::spawn(hold(executor.clone(), "mutex", false, Duration::from_millis(30), intervals.clone()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let exclusive = tokio::spawn(hold(executor.clone(), "mutex", true, Duration::from_millis(10), intervals.clone()));

    shared_a.await.unwrap().unwrap();
    shared_b.await.unwrap().unwrap();
    exclusive.await.unwrap().unwrap();

    let recorded = intervals.lock().clone();
    let shared: Vec<(Instant, Instant)> = recorded.iter().take(2).map(|(_, s, e)| (*s, *e)).collect();
    let (_, ex_start, ex_end) = recorded[2];
    assert!(overlaps(shared[0], shared[1]), "shared holders must run together");
    for window in shared {
        assert!(!overlaps(window, (ex_start, ex_end)), "exclusive holder overlapped a shared one");
    }
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_parent_and_child_keys_conflict() {
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();

    let (a, b) = tokio::join!(
        tokio::spawn(hold(executor.clone(), "root/mutex", true, Duration::from_millis(10), intervals.clone())),
        tokio::spawn(hold(executor.clone(), "root", true, Duration::from_millis(10), intervals.clone())),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert!(!overlaps(interval(&intervals, 0), interval(&intervals, 1)));
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_unrelated_keys_run_concurrently() {
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();

    let (a, b) = tokio::join!(
        tokio::spawn(hold(executor.clone(), "root/a", true, Duration::from_millis(20), intervals.clone())),
        tokio::spawn(hold(executor.clone(), "root/b", true, Duration::from_millis(20), intervals.clone())),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert!(overlaps(interval(&intervals, 0), interval(&intervals, 1)));
    assert!(executor.is_clear());
}

fn window_of(intervals: &Intervals, key: &str) -> (Instant, Instant) {
    let recorded = intervals.lock();
    let (_, start, end) = recorded.iter().find(|(k, _, _)| *k == key).copied().unwrap();
    (start, end)
}

#[tokio::test]
async fn test_queued_writer_admitted_before_late_reader() {
    init_tracing();
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();

    let reader = tokio::spawn(hold(executor.clone(), "mutex/a", false, Duration::from_millis(40), intervals.clone()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let writer = tokio::spawn(hold(executor.clone(), "mutex", true, Duration::from_millis(10), intervals.clone()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late_reader =
        tokio::spawn(hold(executor.clone(), "mutex/b", false, Duration::from_millis(10), intervals.clone()));

    reader.await.unwrap().unwrap();
    writer.await.unwrap().unwrap();
    late_reader.await.unwrap().unwrap();

    let writer = window_of(&intervals, "mutex");
    let late_reader = window_of(&intervals, "mutex/b");
    assert!(writer.0 >= window_of(&intervals, "mutex/a").1, "writer ran next to the first reader");
    assert!(writer.1 <= late_reader.0, "late reader was admitted before the queued writer");
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_reentrant_nesting_does_not_deadlock() {
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let inner = executor.clone();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        executor.lock_single_access("root", None, || async move {
            inner
                .lock_single_access("root/child", None, || async {
                    inner.lock_multi_access("root/child/leaf", None, || async { Ok::<_, MutexError>("leaf") }).await
                })
                .await
        }),
    )
    .await
    .expect("nested locks deadlocked");

    assert_eq!(result.unwrap(), "leaf");
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_independent_chains_wait_instead_of_deadlocking() {
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let intervals = Intervals::default();

    let chain = |executor: MutexExecutor, intervals: Intervals| async move {
        let nested = executor.clone();
        executor
            .lock_single_access("root", None, || async move {
                hold(nested, "root/child", true, Duration::from_millis(10), intervals).await
            })
            .await
    };

    let (a, b) = tokio::join!(
        tokio::spawn(chain(executor.clone(), intervals.clone())),
        tokio::spawn(chain(executor.clone(), intervals.clone())),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    assert!(!overlaps(interval(&intervals, 0), interval(&intervals, 1)));
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_crossed_chains_surface_dead_end() {
    init_tracing();
    for precheck in [true, false] {
        let executor = MutexExecutor::local(MutexConfig::default()).unwrap().with_precheck(precheck);
        let barrier = Arc::new(Barrier::new(2));

        let chain = |first: &'static str, second: &'static str| {
            let executor = executor.clone();
            let barrier = barrier.clone();
            async move {
                let nested = executor.clone();
                executor
                    .lock_single_access(first, None, || async move {
                        barrier.wait().await;
                        nested.lock_single_access(second, None, || async { Ok::<_, MutexError>(()) }).await
                    })
                    .await
            }
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            futures::future::join(tokio::spawn(chain("a", "b")), tokio::spawn(chain("b", "a"))),
        )
        .await
        .expect("crossed chains hung");

        let results = [outcome.0.unwrap(), outcome.1.unwrap()];
        let dead_ends = results.iter().filter(|r| matches!(r, Err(e) if e.is_dead_end())).count();
        assert!(dead_ends >= 1, "precheck={precheck}: expected a dead end, got {results:?}");
        assert!(results.iter().any(Result::is_ok), "precheck={precheck}: the other chain must finish");

        let err = results.into_iter().find_map(Result::err).unwrap();
        let descriptor = err.descriptor().unwrap();
        assert_eq!(descriptor.key.len(), 1);
        assert!(executor.is_clear());
    }
}

#[tokio::test]
async fn test_timeout_unblocks_competitor_and_rejects_watchdog() {
    init_tracing();
    let executor = MutexExecutor::local(MutexConfig::continue_on_timeout()).unwrap();
    let holder_executor = executor.clone();

    let holder = tokio::spawn(async move {
        holder_executor
            .lock_single_access("mutex", Some(Duration::from_millis(20)), || async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                holder_executor.watchdog("after-sleep").await
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let started = Instant::now();
    executor
        .lock_single_access("mutex", None, || async { Ok::<_, MutexError>(()) })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(150), "competitor waited for the timed-out holder");

    let err = holder.await.unwrap().unwrap_err();
    assert!(matches!(err, MutexError::WatchdogRejection { ref phase, .. } if phase == "after-sleep"));
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_pending_timeout_rejects_waiter() {
    let executor = MutexExecutor::local(MutexConfig::continue_on_timeout()).unwrap();
    let holder_executor = executor.clone();
    let holder = tokio::spawn(async move {
        holder_executor
            .lock_single_access("mutex", None, || async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, MutexError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = executor
        .lock_single_access("mutex", Some(Duration::from_millis(20)), || async { Ok::<_, MutexError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    let descriptor = err.descriptor().unwrap();
    assert_eq!(descriptor.key_path(), "mutex");
    assert_eq!(descriptor.blocked_by.len(), 1);

    holder.await.unwrap().unwrap();
    assert!(executor.is_clear());
}

#[derive(Debug, Default)]
struct CountingHandler {
    seen: AtomicUsize,
}

impl TimeoutHandler for CountingHandler {
    fn handle_timeout(&self, _descriptor: &LockDescriptor, origin: &RequestOrigin) -> TimeoutAction {
        assert_eq!(*origin, RequestOrigin::Local);
        self.seen.fetch_add(1, Ordering::SeqCst);
        TimeoutAction::RejectCaller
    }
}

#[tokio::test]
async fn test_custom_timeout_handler_is_consulted() {
    let handler = Arc::new(CountingHandler::default());
    let synchronizer = LocalSynchronizer::with_timeout_handler(MutexConfig::default(), handler.clone()).unwrap();
    let executor = MutexExecutor::new(Arc::new(synchronizer));

    let result = executor
        .lock_single_access("mutex", Some(Duration::from_millis(10)), || async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            executor.watchdog("late").await
        })
        .await;

    assert!(matches!(result, Err(MutexError::WatchdogRejection { .. })));
    assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    assert!(executor.is_clear());
}

#[tokio::test]
async fn test_body_error_propagates_after_unlock() {
    #[derive(Debug)]
    enum AppError {
        Mutex(MutexError),
        Failed(&'static str),
    }
    impl From<MutexError> for AppError {
        fn from(error: MutexError) -> Self {
            AppError::Mutex(error)
        }
    }

    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let result: Result<(), AppError> =
        executor.lock_single_access("mutex", None, || async { Err(AppError::Failed("boom")) }).await;
    assert!(matches!(result, Err(AppError::Failed("boom"))));
    assert!(executor.is_clear());

    let result: Result<(), AppError> = executor.watchdog("outside").await.map_err(AppError::from);
    assert!(matches!(result, Err(AppError::Mutex(MutexError::NotInLockedScope))));
}

#[tokio::test]
async fn test_safe_callback_ends_locked_scope_early() {
    let executor = MutexExecutor::local(MutexConfig::default()).unwrap();
    let callback = Arc::new(SafeCallback::new());
    let resolver = callback.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.resolve(42);
    });

    let value = executor
        .lock_single_access("mutex", None, || async {
            callback
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    0
                })
                .await
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert!(executor.is_clear());
}
