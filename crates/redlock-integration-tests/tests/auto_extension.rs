//! Locks kept alive in the background, and the `using` helper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redlock_core::{
    ErrorKind, ExtensionState, LockSettings, LockStore, MemoryStore, Operation, Redlock,
    ReleaseStatus, ResourceSet,
};
use redlock_integration_tests::{CountingStore, MemoryCluster, init_test_logging};

#[tokio::test(start_paused = true)]
async fn auto_extension_outlives_ttl_and_releases() {
    init_test_logging();
    let cluster = MemoryCluster::new(3);
    let resources = ResourceSet::single("lock:job").unwrap();
    let handle = cluster
        .redlock
        .acquire(&resources, Duration::from_millis(1000))
        .await
        .unwrap();
    let token = handle.token().clone();

    let extension = cluster.redlock.auto_extend(handle);
    tokio::time::sleep(Duration::from_millis(4000)).await;

    assert_eq!(cluster.holders("lock:job", token.as_str()), 3);
    assert!(matches!(
        extension.state(),
        ExtensionState::Active { extensions, .. } if extensions >= 6
    ));

    let report = extension.release().await.unwrap();
    assert_eq!(report.status, ReleaseStatus::Released);
    assert_eq!(cluster.live("lock:job"), 0);
}

#[tokio::test(start_paused = true)]
async fn no_extend_after_release() {
    init_test_logging();
    let counting = Arc::new(CountingStore::new(Arc::new(MemoryStore::new("mem-0"))));
    let redlock = Redlock::new(
        vec![counting.clone() as Arc<dyn LockStore>],
        LockSettings::default(),
    )
    .unwrap();
    let resources = ResourceSet::single("lock:job").unwrap();
    let handle = redlock
        .acquire(&resources, Duration::from_millis(1000))
        .await
        .unwrap();

    let extension = redlock.auto_extend(handle);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    extension.release().await.unwrap();
    let extends = counting.calls(Operation::Extend);
    assert!(extends >= 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(counting.calls(Operation::Extend), extends);
    assert_eq!(counting.calls(Operation::Release), 1);
}

#[tokio::test(start_paused = true)]
async fn stolen_lock_marks_extension_lost() {
    init_test_logging();
    let cluster = MemoryCluster::with_settings(
        3,
        LockSettings {
            retry_count: 1,
            ..Default::default()
        },
    );
    let resources = ResourceSet::single("lock:job").unwrap();
    let handle = cluster
        .redlock
        .acquire(&resources, Duration::from_millis(1000))
        .await
        .unwrap();
    let extension = cluster.redlock.auto_extend(handle);
    let signal = extension.signal();

    cluster.fail_last(2);
    let err = tokio::time::timeout(Duration::from_secs(5), signal.lost())
        .await
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::QuorumNotAchieved);
    assert!(matches!(extension.state(), ExtensionState::Lost(_)));

    let err = extension.release().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandleInvalid);
}

#[tokio::test(start_paused = true)]
async fn using_runs_routine_under_lock() {
    init_test_logging();
    let cluster = MemoryCluster::new(3);
    let resources = ResourceSet::new(["lock:a", "lock:b"]).unwrap();

    let stores = cluster.stores.clone();
    let seen = cluster
        .redlock
        .using(&resources, Duration::from_millis(1000), |signal| async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            assert!(!signal.is_lost());
            assert!(signal.remaining() > Duration::ZERO);
            stores.iter().filter(|s| s.get("lock:b").is_some()).count()
        })
        .await
        .unwrap();

    assert_eq!(seen, 3);
    assert_eq!(cluster.live("lock:a"), 0);
    assert_eq!(cluster.live("lock:b"), 0);
}

#[tokio::test(start_paused = true)]
async fn using_fails_when_resource_is_taken() {
    init_test_logging();
    let cluster = MemoryCluster::with_settings(
        1,
        LockSettings {
            retry_count: 0,
            ..Default::default()
        },
    );
    cluster
        .store(0)
        .put("lock:job", "foreign", Duration::from_secs(60));
    let resources = ResourceSet::single("lock:job").unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let err = cluster
        .redlock
        .using(&resources, Duration::from_millis(1000), |_| async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();
    assert!(err.is_quorum_failure());
    assert!(!ran.load(Ordering::SeqCst));
}
