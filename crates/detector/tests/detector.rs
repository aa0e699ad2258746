//! Detector passes against the mock cluster

use std::sync::Arc;
use tessera_common::{ClusterRuntime, CompNodeId, GlobalTxnId, ShardId};
use tessera_detector::{DeadlockDetector, DetectorConfig};
use tessera_dispatch::{Dispatcher, DispatcherConfig};
use tessera_pool::mock::{LockWaitPair, LockWaitTxn, MockCluster};
use tessera_pool::ShardPool;

fn setup(shards: &[u32]) -> (Arc<MockCluster>, DeadlockDetector) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let cluster = MockCluster::new(shards.iter().map(|&s| ShardId(s)));
    let runtime = Arc::new(ClusterRuntime::new(CompNodeId(9)));
    let pool = ShardPool::new(runtime.clone(), cluster.clone(), cluster.connector(), false);
    let dispatcher = Dispatcher::new(runtime.clone(), pool, DispatcherConfig::default());
    let detector = DeadlockDetector::new(runtime, dispatcher, DetectorConfig::default());
    (cluster, detector)
}

fn branch(txn: GlobalTxnId, conn_id: u32, start_ts: i64) -> LockWaitTxn {
    LockWaitTxn {
        txn,
        conn_id,
        start_ts,
        rows_changed: 1,
        rows_locked: 1,
    }
}

fn pair(waiter: LockWaitTxn, blocker: LockWaitTxn) -> LockWaitPair {
    LockWaitPair { waiter, blocker }
}

#[tokio::test]
async fn test_cross_shard_cycle_kills_one_victim_and_stays_idempotent() {
    let (cluster, mut detector) = setup(&[1, 2]);
    let a = GlobalTxnId::new(CompNodeId(1), 100, 1);
    let b = GlobalTxnId::new(CompNodeId(1), 200, 2);
    let c = GlobalTxnId::new(CompNodeId(2), 300, 3);

    // A → B and C → A on shard 1, B → C on shard 2: a three-transaction
    // cycle spanning both shards.
    cluster.shard(ShardId(1)).set_lock_waits(vec![
        pair(branch(a, 11, 100), branch(b, 12, 200)),
        pair(branch(c, 13, 300), branch(a, 11, 100)),
    ]);
    cluster
        .shard(ShardId(2))
        .set_lock_waits(vec![pair(branch(b, 22, 200), branch(c, 23, 300))]);

    let report = detector.run_pass().await.unwrap();
    assert_eq!(report.shards_polled, 2);
    // Default policy kills the youngest transaction, C, on both its shards.
    assert_eq!(report.victims, vec![c]);
    assert_eq!(report.kills, 2);
    assert_eq!(cluster.shard(ShardId(1)).kills(), vec![13]);
    assert_eq!(cluster.shard(ShardId(2)).kills(), vec![23]);

    // Unchanged lock state: the kill is still propagating, nothing new.
    let report = detector.run_pass().await.unwrap();
    assert!(report.victims.is_empty());
    assert_eq!(report.kills, 0);
    assert_eq!(cluster.shard(ShardId(1)).kills(), vec![13]);

    // Victim gone from the views: quiet pass.
    cluster.shard(ShardId(1)).clear_lock_waits();
    cluster.shard(ShardId(2)).clear_lock_waits();
    let report = detector.run_pass().await.unwrap();
    assert!(report.victims.is_empty());
    assert_eq!(report.shards_polled, 2);
}

#[tokio::test]
async fn test_single_shard_cycle_is_left_alone() {
    let (cluster, mut detector) = setup(&[1, 2]);
    let a = GlobalTxnId::new(CompNodeId(1), 100, 1);
    let b = GlobalTxnId::new(CompNodeId(1), 200, 2);

    cluster.shard(ShardId(1)).set_lock_waits(vec![
        pair(branch(a, 11, 100), branch(b, 12, 200)),
        pair(branch(b, 12, 200), branch(a, 11, 100)),
    ]);

    let report = detector.run_pass().await.unwrap();
    assert_eq!(report.shards_polled, 2);
    assert!(report.victims.is_empty());
    assert!(cluster.shard(ShardId(1)).kills().is_empty());
}

#[tokio::test]
async fn test_single_shard_cluster_skips_the_pass() {
    let (cluster, mut detector) = setup(&[1]);
    let report = detector.run_pass().await.unwrap();
    assert_eq!(report, Default::default());
    assert!(cluster.shard(ShardId(1)).sql_log().is_empty());
}

#[tokio::test]
async fn test_unsupported_engine_version_disables_the_detector() {
    let (cluster, mut detector) = setup(&[1, 2]);
    cluster.shard(ShardId(1)).set_version("8.0.32-generic");
    cluster.shard(ShardId(2)).set_version("8.0.32-generic");

    let report = detector.run_pass().await.unwrap();
    assert_eq!(report.shards_polled, 0);
    assert_eq!(report.shards_skipped, 2);

    detector.run_pass().await.unwrap();
    let log = cluster.shard(ShardId(1)).sql_log();
    // Probed once, cached; the diagnostic query never went out.
    assert_eq!(
        log.iter().filter(|s| *s == "SELECT version()").count(),
        1
    );
    assert!(!log.iter().any(|s| s.starts_with("SELECT waiter.")));
}

#[tokio::test]
async fn test_unreachable_shard_skips_only_that_shard() {
    let (cluster, mut detector) = setup(&[1, 2, 3]);
    let a = GlobalTxnId::new(CompNodeId(1), 100, 1);
    let b = GlobalTxnId::new(CompNodeId(1), 200, 2);

    // A cycle between shards 1 and 2; shard 3 is down.
    cluster
        .shard(ShardId(1))
        .set_lock_waits(vec![pair(branch(a, 11, 100), branch(b, 12, 200))]);
    cluster
        .shard(ShardId(2))
        .set_lock_waits(vec![pair(branch(b, 22, 200), branch(a, 21, 100))]);
    cluster.shard(ShardId(3)).set_unreachable(true);

    let report = detector.run_pass().await.unwrap();
    assert_eq!(report.shards_polled, 2);
    assert_eq!(report.shards_skipped, 1);
    assert_eq!(report.victims, vec![b]);
}
