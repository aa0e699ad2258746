//! In-process mock shards
//!
//! Plays the role of a real storage cluster for tests across the whole
//! workspace: scripted replies, per-shard latency, captured SQL, lock-wait
//! diagnostics and kill bookkeeping. A `MockCluster` is both the topology
//! and the connection factory.

use crate::error::{PoolError, Result};
use crate::topology::{ShardNode, ShardTopology};
use crate::wire::{split_batch, Reply, Row, ShardConnector, ShardSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{GlobalTxnId, NodeId, ShardId};

/// One side of a lock-wait observation on a shard.
#[derive(Debug, Clone)]
pub struct LockWaitTxn {
    pub txn: GlobalTxnId,
    pub conn_id: u32,
    pub start_ts: i64,
    pub rows_changed: u64,
    pub rows_locked: u64,
}

/// One waiter→blocker pair reported by a shard's diagnostic view.
#[derive(Debug, Clone)]
pub struct LockWaitPair {
    pub waiter: LockWaitTxn,
    pub blocker: LockWaitTxn,
}

impl LockWaitPair {
    fn to_row(&self) -> Row {
        fn half(t: &LockWaitTxn, row: &mut Row) {
            row.push(Some(format!("'{}'", t.txn)));
            row.push(Some(t.conn_id.to_string()));
            row.push(Some(t.start_ts.to_string()));
            row.push(Some(t.rows_changed.to_string()));
            row.push(Some(t.rows_locked.to_string()));
        }
        let mut row = Vec::with_capacity(10);
        half(&self.waiter, &mut row);
        half(&self.blocker, &mut row);
        row
    }
}

#[derive(Default)]
struct ShardState {
    version: String,
    latency: Duration,
    unreachable: bool,
    primary: bool,
    default_affected: u64,
    scripted: VecDeque<Reply>,
    lock_waits: Vec<LockWaitPair>,
    sql_log: Vec<String>,
    kills: Vec<u32>,
    next_conn_id: u32,
    fail_round_trips: u32,
}

/// One mock storage shard.
pub struct MockShard {
    id: ShardId,
    state: Mutex<ShardState>,
}

impl MockShard {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            state: Mutex::new(ShardState {
                version: "8.0.32-tessera-storage".to_string(),
                primary: true,
                default_affected: 1,
                next_conn_id: 100,
                ..ShardState::default()
            }),
        }
    }

    pub fn set_version(&self, version: impl Into<String>) {
        self.state.lock().version = version.into();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn set_primary(&self, primary: bool) {
        self.state.lock().primary = primary;
    }

    /// Affected-row count reported for unscripted non-SELECT statements.
    pub fn set_default_affected(&self, affected: u64) {
        self.state.lock().default_affected = affected;
    }

    /// Queue a reply consumed by the next unscripted generic statement.
    pub fn push_reply(&self, reply: Reply) {
        self.state.lock().scripted.push_back(reply);
    }

    /// Fail the next `n` round trips with a connectivity error.
    pub fn fail_next_round_trips(&self, n: u32) {
        self.state.lock().fail_round_trips = n;
    }

    pub fn set_lock_waits(&self, pairs: Vec<LockWaitPair>) {
        self.state.lock().lock_waits = pairs;
    }

    pub fn clear_lock_waits(&self) {
        self.state.lock().lock_waits.clear();
    }

    /// Every statement executed on this shard, in order.
    pub fn sql_log(&self) -> Vec<String> {
        self.state.lock().sql_log.clone()
    }

    /// Connection ids targeted by `KILL QUERY` so far.
    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().kills.clone()
    }

    fn execute(&self, stmt: &str) -> Reply {
        let mut state = self.state.lock();
        state.sql_log.push(stmt.to_string());

        let lower = stmt.to_ascii_lowercase();
        if lower == "select version()" {
            return Reply::Rows(vec![vec![Some(state.version.clone())]]);
        }
        if lower.contains("@@super_read_only") {
            let ro = if state.primary { "0" } else { "1" };
            return Reply::Rows(vec![vec![Some(ro.to_string())]]);
        }
        if let Some(rest) = lower.strip_prefix("kill query ") {
            if let Ok(id) = rest.trim().parse::<u32>() {
                state.kills.push(id);
            }
            return Reply::Done {
                affected_rows: 0,
                warnings: 0,
            };
        }
        if lower.starts_with("select waiter.") {
            let rows = state.lock_waits.iter().map(LockWaitPair::to_row).collect();
            return Reply::Rows(rows);
        }
        if lower.starts_with("set ")
            || lower.starts_with("xa ")
            || lower.starts_with("savepoint ")
            || lower.starts_with("release savepoint ")
            || lower.starts_with("rollback to ")
        {
            return Reply::Done {
                affected_rows: 0,
                warnings: 0,
            };
        }
        if let Some(reply) = state.scripted.pop_front() {
            return reply;
        }
        if lower.starts_with("select ") {
            Reply::Rows(Vec::new())
        } else {
            Reply::Done {
                affected_rows: state.default_affected,
                warnings: 0,
            }
        }
    }
}

/// The whole mock storage cluster: shards, topology and connector in one.
pub struct MockCluster {
    shards: BTreeMap<ShardId, Arc<MockShard>>,
    completion_seq: AtomicU64,
    completion_log: Mutex<Vec<ShardId>>,
}

impl MockCluster {
    /// Build a cluster with the given shard ids, one node each.
    pub fn new(shards: impl IntoIterator<Item = ShardId>) -> Arc<Self> {
        let shards = shards
            .into_iter()
            .map(|id| (id, Arc::new(MockShard::new(id))))
            .collect();
        Arc::new(Self {
            shards,
            completion_seq: AtomicU64::new(0),
            completion_log: Mutex::new(Vec::new()),
        })
    }

    pub fn shard(&self, id: ShardId) -> Arc<MockShard> {
        self.shards.get(&id).cloned().expect("unknown mock shard")
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    /// Shards in the order their round trips completed.
    pub fn completion_order(&self) -> Vec<ShardId> {
        self.completion_log.lock().clone()
    }

    fn note_completion(&self, shard: ShardId) {
        self.completion_seq.fetch_add(1, Ordering::Relaxed);
        self.completion_log.lock().push(shard);
    }
}

impl ShardTopology for MockCluster {
    fn lookup(&self, shard: ShardId) -> Result<Vec<ShardNode>> {
        if !self.shards.contains_key(&shard) {
            return Err(PoolError::UnknownShard(shard));
        }
        Ok(vec![ShardNode {
            node_id: NodeId(1),
            host: format!("mock-shard-{shard}"),
            port: 0,
            user: "tessera".to_string(),
            password: String::new(),
        }])
    }

    fn all_shards(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }
}

/// Connection factory over the mock cluster.
pub struct MockConnector {
    cluster: Arc<MockCluster>,
}

#[async_trait]
impl ShardConnector for MockConnector {
    async fn connect(&self, shard: ShardId, _node: &ShardNode) -> Result<Box<dyn ShardSession>> {
        let mock = self
            .cluster
            .shards
            .get(&shard)
            .ok_or(PoolError::UnknownShard(shard))?
            .clone();
        let conn_id = {
            let mut state = mock.state.lock();
            if state.unreachable {
                return Err(PoolError::Connectivity {
                    shard,
                    reason: "mock shard unreachable".to_string(),
                });
            }
            state.next_conn_id += 1;
            state.next_conn_id
        };
        Ok(Box::new(MockSession {
            shard: mock,
            cluster: self.cluster.clone(),
            conn_id,
        }))
    }
}

struct MockSession {
    shard: Arc<MockShard>,
    cluster: Arc<MockCluster>,
    conn_id: u32,
}

#[async_trait]
impl ShardSession for MockSession {
    fn connection_id(&self) -> u32 {
        self.conn_id
    }

    async fn round_trip(&mut self, batch: &str) -> Result<Vec<Reply>> {
        let (latency, fail) = {
            let mut state = self.shard.state.lock();
            if state.unreachable {
                return Err(PoolError::Connectivity {
                    shard: self.shard.id,
                    reason: "mock shard unreachable".to_string(),
                });
            }
            let fail = if state.fail_round_trips > 0 {
                state.fail_round_trips -= 1;
                true
            } else {
                false
            };
            (state.latency, fail)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(PoolError::Connectivity {
                shard: self.shard.id,
                reason: "mock connection dropped".to_string(),
            });
        }

        let replies = split_batch(batch)
            .into_iter()
            .map(|stmt| self.shard.execute(stmt))
            .collect();
        self.cluster.note_completion(self.shard.id);
        Ok(replies)
    }
}
