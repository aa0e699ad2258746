//! Dispatcher behavior against the mock cluster

use std::sync::Arc;
use std::time::Duration;
use tessera_common::{ClusterRuntime, CommandKind, CompNodeId, ServerError, ShardId};
use tessera_dispatch::{DispatchError, Dispatcher, DispatcherConfig, JobStatus, StatementJob};
use tessera_pool::mock::MockCluster;
use tessera_pool::{PoolError, Reply, ShardPool};
use tokio::time::Instant;

fn setup(
    shards: &[u32],
    config: DispatcherConfig,
) -> (Arc<MockCluster>, Arc<ClusterRuntime>, Dispatcher) {
    let cluster = MockCluster::new(shards.iter().map(|&s| ShardId(s)));
    let runtime = Arc::new(ClusterRuntime::new(CompNodeId(1)));
    let pool = ShardPool::new(runtime.clone(), cluster.clone(), cluster.connector(), false);
    let dispatcher = Dispatcher::new(runtime.clone(), pool, config);
    (cluster, runtime, dispatcher)
}

fn write(sql: &str) -> StatementJob {
    StatementJob::new(sql, CommandKind::Write)
}

#[tokio::test(start_paused = true)]
async fn test_flush_waits_for_slowest_shard_not_the_sum() {
    let ids: Vec<u32> = (1..=10).collect();
    let (cluster, _runtime, mut dispatcher) = setup(&ids, DispatcherConfig::default());
    for &id in &ids[..9] {
        cluster
            .shard(ShardId(id))
            .set_latency(Duration::from_millis(5));
    }
    cluster
        .shard(ShardId(10))
        .set_latency(Duration::from_millis(200));

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| dispatcher.enqueue(ShardId(id), write("UPDATE t SET v = v + 1")))
        .collect();

    let started = Instant::now();
    dispatcher.flush_all().await.unwrap();
    let elapsed = started.elapsed();

    for handle in &handles {
        assert_eq!(handle.status(), JobStatus::Done);
        assert_eq!(handle.affected_rows(), 1);
    }
    // Ten overlapped round trips cost one slow round trip, not the sum.
    assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");
    let order = cluster.completion_order();
    assert_eq!(order.len(), 10);
    assert_eq!(*order.last().unwrap(), ShardId(10));
}

#[tokio::test]
async fn test_fifo_per_shard_and_preamble_on_first_batch() {
    let (cluster, _runtime, mut dispatcher) = setup(&[1], DispatcherConfig::default());
    let h1 = dispatcher.enqueue(ShardId(1), write("UPDATE a SET v = 1"));
    let h2 = dispatcher.enqueue(ShardId(1), write("UPDATE b SET v = 2"));
    let h3 = dispatcher.enqueue(ShardId(1), write("UPDATE c SET v = 3"));
    dispatcher.flush_all().await.unwrap();

    assert!(h1.is_finished() && h2.is_finished() && h3.is_finished());
    let log = cluster.shard(ShardId(1)).sql_log();
    // Preamble rides the first batch.
    assert_eq!(log[0], "SET NAMES utf8mb4");
    let updates: Vec<&str> = log
        .iter()
        .filter(|s| s.starts_with("UPDATE"))
        .map(|s| s.as_str())
        .collect();
    assert_eq!(
        updates,
        vec!["UPDATE a SET v = 1", "UPDATE b SET v = 2", "UPDATE c SET v = 3"]
    );
    // Preamble is not resent on later batches.
    assert_eq!(log.iter().filter(|s| *s == "SET NAMES utf8mb4").count(), 1);
}

#[tokio::test]
async fn test_server_error_keeps_connection_alive() {
    let (cluster, _runtime, mut dispatcher) = setup(&[1], DispatcherConfig::default());
    cluster.shard(ShardId(1)).push_reply(Reply::Err(ServerError {
        code: 1062,
        message: "duplicate entry".to_string(),
    }));

    let handle = dispatcher.enqueue(ShardId(1), write("INSERT INTO t VALUES (1)"));
    dispatcher.flush_all().await.unwrap();
    assert_eq!(handle.status(), JobStatus::Failed);
    assert_eq!(handle.error().unwrap().server_code(), Some(1062));

    // Same connection serves the next statement; no reconnect, no kill.
    let handle = dispatcher.enqueue(ShardId(1), write("INSERT INTO t VALUES (2)"));
    dispatcher.flush_all().await.unwrap();
    assert_eq!(handle.status(), JobStatus::Done);
    assert!(cluster.shard(ShardId(1)).kills().is_empty());
    let log = cluster.shard(ShardId(1)).sql_log();
    assert_eq!(log.iter().filter(|s| *s == "SET NAMES utf8mb4").count(), 1);
}

#[tokio::test]
async fn test_ignored_error_code_counts_as_success() {
    let (cluster, _runtime, mut dispatcher) = setup(&[1], DispatcherConfig::default());
    cluster.shard(ShardId(1)).push_reply(Reply::Err(ServerError {
        code: 1051,
        message: "unknown table".to_string(),
    }));

    let handle = dispatcher.enqueue(
        ShardId(1),
        StatementJob::new("DROP TABLE leftovers", CommandKind::Write).ignoring(1051),
    );
    dispatcher.flush_all().await.unwrap();
    assert_eq!(handle.status(), JobStatus::Done);
    assert!(handle.error().is_none());
}

#[tokio::test]
async fn test_transport_failure_tears_down_and_schedules_topology_check() {
    let (cluster, runtime, mut dispatcher) = setup(&[1, 2], DispatcherConfig::default());
    cluster.shard(ShardId(2)).fail_next_round_trips(1);

    let ok = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    let bad = dispatcher.enqueue(ShardId(2), write("UPDATE t SET v = 2"));
    let err = dispatcher.flush_all().await.unwrap_err();

    assert!(matches!(err, DispatchError::Pool(PoolError::Connectivity { .. })));
    assert_eq!(ok.status(), JobStatus::Done);
    assert_eq!(bad.status(), JobStatus::Failed);
    assert!(runtime.drain_topology_checks().contains(&ShardId(2)));
    assert!(!dispatcher.is_connected(ShardId(2)));
    assert!(dispatcher.is_connected(ShardId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_kills_in_flight_query() {
    let config = DispatcherConfig {
        statement_timeout: Duration::from_millis(50),
        detector_wake_after: None,
    };
    let (cluster, runtime, mut dispatcher) = setup(&[1], config);
    cluster.shard(ShardId(1)).set_latency(Duration::from_secs(10));

    let handle = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    let err = dispatcher.flush_all().await.unwrap_err();

    assert!(matches!(err, DispatchError::Timeout { .. }));
    assert_eq!(handle.status(), JobStatus::Failed);
    assert!(matches!(handle.error(), Some(DispatchError::Cancelled)));
    // The stuck server-side query is killed from a fresh connection.
    assert_eq!(cluster.shard(ShardId(1)).kills(), vec![101]);
    assert!(runtime.drain_topology_checks().contains(&ShardId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_preamble_resent_after_cancel_reuses_kill_connection() {
    let config = DispatcherConfig {
        statement_timeout: Duration::from_millis(50),
        detector_wake_after: None,
    };
    let (cluster, _runtime, mut dispatcher) = setup(&[1], config);
    cluster.shard(ShardId(1)).set_latency(Duration::from_secs(10));

    dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    let err = dispatcher.flush_all().await.unwrap_err();
    assert!(matches!(err, DispatchError::Timeout { .. }));
    assert_eq!(cluster.shard(ShardId(1)).kills(), vec![101]);

    // The kill went out on a fresh connection without the preamble; reusing
    // that connection for transactional work must resend it first.
    cluster.shard(ShardId(1)).set_latency(Duration::ZERO);
    let handle = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 2"));
    dispatcher.flush_all().await.unwrap();
    assert_eq!(handle.status(), JobStatus::Done);

    let log = cluster.shard(ShardId(1)).sql_log();
    let kill_ix = log
        .iter()
        .position(|s| s.starts_with("KILL QUERY"))
        .unwrap();
    let after = &log[kill_ix + 1..];
    let update_ix = after
        .iter()
        .position(|s| *s == "UPDATE t SET v = 2")
        .unwrap();
    assert!(after[..update_ix].iter().any(|s| *s == "SET NAMES utf8mb4"));
}

#[tokio::test]
async fn test_result_set_pins_connection_until_drained() {
    let (cluster, _runtime, mut dispatcher) = setup(&[1], DispatcherConfig::default());
    cluster
        .shard(ShardId(1))
        .push_reply(Reply::Rows(vec![vec![Some("42".to_string())]]));

    let select = dispatcher.enqueue(ShardId(1), StatementJob::new("SELECT v FROM t", CommandKind::Read));
    dispatcher.flush_all().await.unwrap();
    assert_eq!(select.status(), JobStatus::Done);

    // A second job queues behind the undrained result.
    let second = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 2"));
    dispatcher.try_advance();
    assert_eq!(second.status(), JobStatus::Queued);

    assert_eq!(select.fetch_row().unwrap()[0].as_deref(), Some("42"));
    assert!(select.fetch_row().is_none());
    dispatcher.flush_all().await.unwrap();
    assert_eq!(second.status(), JobStatus::Done);
}

#[tokio::test]
async fn test_write_rows_accumulate_per_transaction() {
    let (cluster, _runtime, mut dispatcher) = setup(&[1, 2], DispatcherConfig::default());
    cluster.shard(ShardId(1)).set_default_affected(3);
    cluster.shard(ShardId(2)).set_default_affected(4);

    dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    dispatcher.enqueue(ShardId(2), write("UPDATE t SET v = 1"));
    dispatcher.enqueue(ShardId(1), StatementJob::new("SELECT 1", CommandKind::Read));
    dispatcher.flush_all().await.unwrap();
    assert_eq!(dispatcher.txn_affected_rows(), 7);

    dispatcher.finish_txn();
    assert_eq!(dispatcher.txn_affected_rows(), 0);
    assert!(dispatcher.used_shards().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_wakes_deadlock_detector() {
    let config = DispatcherConfig {
        statement_timeout: Duration::from_secs(10),
        detector_wake_after: Some(Duration::from_millis(100)),
    };
    let (cluster, runtime, mut dispatcher) = setup(&[1], config);
    cluster
        .shard(ShardId(1))
        .set_latency(Duration::from_millis(300));

    let handle = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    dispatcher.flush_all().await.unwrap();

    assert_eq!(handle.status(), JobStatus::Done);
    assert_eq!(runtime.take_wake_requests(), 1);
}

#[tokio::test]
async fn test_stale_primary_is_caught_by_preamble_probe() {
    let cluster = MockCluster::new([ShardId(1)]);
    let runtime = Arc::new(ClusterRuntime::new(CompNodeId(1)));
    let pool = ShardPool::new(runtime.clone(), cluster.clone(), cluster.connector(), true);
    let mut dispatcher = Dispatcher::new(runtime, pool, DispatcherConfig::default());
    cluster.shard(ShardId(1)).set_primary(false);

    let handle = dispatcher.enqueue(ShardId(1), write("UPDATE t SET v = 1"));
    let err = dispatcher.flush_all().await.unwrap_err();
    assert!(matches!(err, DispatchError::Pool(PoolError::StaleTopology { .. })));
    assert_eq!(handle.status(), JobStatus::Failed);
}
