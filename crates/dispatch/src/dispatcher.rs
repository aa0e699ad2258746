//! Non-blocking statement dispatcher
//!
//! One dispatcher per owning flow. Statements queue per shard; each shard
//! connection carries at most one round trip at a time, and the flush wait
//! polls every in-flight round trip at once, so a statement fanned out to N
//! shards costs the latency of the slowest shard rather than the sum. A
//! round-trip future owns its connection and hands it back with the result;
//! dropping one mid-flight (cancellation) leaves the wire undefined, so that
//! path always tears the connection down and issues `KILL QUERY` from a
//! fresh one.

use crate::error::{DispatchError, Result};
use crate::job::{JobHandle, StatementJob};
use futures::task::noop_waker;
use std::collections::{BTreeMap, VecDeque};
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tessera_common::{ClusterRuntime, CommandKind, NodeId, ServerError, ShardId};
use tessera_pool::{PoolError, PooledConn, Preamble, Reply, Row, ShardPool, Target};
use tokio::time::Instant;

/// Tunables for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-round-trip deadline. Hitting it cancels the whole statement.
    pub statement_timeout: Duration,
    /// Wake the deadlock detector once a write statement has been waiting
    /// this long, on the theory that it sits in a remote lock queue.
    pub detector_wake_after: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(10),
            detector_wake_after: Some(Duration::from_millis(100)),
        }
    }
}

type RoundTrip =
    Pin<Box<dyn Future<Output = (PooledConn, tessera_pool::Result<Vec<Reply>>)> + Send>>;

struct InFlight {
    fut: RoundTrip,
    conn_id: u32,
    node: NodeId,
    handle: JobHandle,
    kind: CommandKind,
    ignore_error: Option<u32>,
    preamble_len: usize,
    primary_probe: Option<usize>,
    deadline: Instant,
}

#[derive(Default)]
struct Channel {
    /// Connection parked between jobs for the duration of the statement
    /// or transaction; `None` while a round trip owns it.
    conn: Option<PooledConn>,
    queue: VecDeque<(StatementJob, JobHandle)>,
    inflight: Option<InFlight>,
    /// Row-returning result not yet drained; pins the connection.
    held: Option<JobHandle>,
}

impl Channel {
    fn blocked(&self) -> bool {
        self.held
            .as_ref()
            .map(|h| !h.result_released())
            .unwrap_or(false)
    }
}

enum WaitOutcome {
    Completed,
    WakeDetector,
    Deadline,
}

/// Per-shard statement queues multiplexed over the connection pool.
pub struct Dispatcher {
    runtime: Arc<ClusterRuntime>,
    pool: ShardPool,
    config: DispatcherConfig,
    channels: BTreeMap<ShardId, Channel>,
    txn_affected_rows: u64,
    /// First teardown-class failure seen since the last flush started.
    /// SQL-level errors stay on their handles only.
    flush_err: Option<DispatchError>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<ClusterRuntime>, pool: ShardPool, config: DispatcherConfig) -> Self {
        Self {
            runtime,
            pool,
            config,
            channels: BTreeMap::new(),
            txn_affected_rows: 0,
            flush_err: None,
        }
    }

    pub fn runtime(&self) -> &Arc<ClusterRuntime> {
        &self.runtime
    }

    pub fn pool_mut(&mut self) -> &mut ShardPool {
        &mut self.pool
    }

    /// Shards with a queued, in-flight, or parked channel this transaction.
    pub fn used_shards(&self) -> Vec<ShardId> {
        self.channels.keys().copied().collect()
    }

    /// Whether the channel to a shard still has a live connection.
    pub fn is_connected(&self, shard: ShardId) -> bool {
        self.channels
            .get(&shard)
            .map(|c| c.conn.is_some() || c.inflight.is_some())
            .unwrap_or(false)
    }

    /// Rows changed by write statements since the last [`Self::finish_txn`].
    pub fn txn_affected_rows(&self) -> u64 {
        self.txn_affected_rows
    }

    /// Queue a statement for a shard. FIFO per shard; nothing is sent until
    /// the dispatcher is driven by [`Self::flush_all`] or
    /// [`Self::try_advance`].
    pub fn enqueue(&mut self, shard: ShardId, job: StatementJob) -> JobHandle {
        let handle = JobHandle::new();
        self.channels
            .entry(shard)
            .or_default()
            .queue
            .push_back((job, handle.clone()));
        handle
    }

    /// Drive every queue until all jobs have completed or failed. Returns
    /// the first transport-level failure; per-job outcomes are on the
    /// handles either way.
    pub async fn flush_all(&mut self) -> Result<()> {
        let mut first_err: Option<DispatchError> = None;
        self.flush_err = None;
        let has_write = self.channels.values().any(|c| {
            c.queue
                .iter()
                .any(|(j, _)| matches!(j.kind, CommandKind::Write))
        });
        let mut wake_at = match self.config.detector_wake_after {
            Some(after) if has_write => Some(Instant::now() + after),
            _ => None,
        };

        loop {
            if self.release_blocking_results() {
                tracing::debug!("discarding unread result set at flush");
            }
            if let Some(err) = self.start_ready().await {
                first_err.get_or_insert(err);
            }
            if !self.any_inflight() {
                if self.has_outstanding() {
                    continue;
                }
                break;
            }
            match self.await_one(wake_at).await {
                WaitOutcome::Completed => {}
                WaitOutcome::WakeDetector => {
                    tracing::debug!("write statement stalled, waking deadlock detector");
                    self.runtime.wake_detector();
                    wake_at = None;
                }
                WaitOutcome::Deadline => {
                    let timeout = self.config.statement_timeout;
                    tracing::warn!(?timeout, "statement deadline reached, cancelling");
                    self.cancel_all().await;
                    return Err(DispatchError::Timeout { timeout });
                }
            }
        }

        match first_err.or_else(|| self.flush_err.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Poll every in-flight round trip once without waiting, then launch
    /// whatever became startable on connections already held. Returns
    /// whether any round trip completed.
    pub fn try_advance(&mut self) -> bool {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut done = Vec::new();
        for (shard, ch) in self.channels.iter_mut() {
            if let Some(inf) = ch.inflight.as_mut() {
                if let Poll::Ready(out) = inf.fut.as_mut().poll(&mut cx) {
                    let inf = ch.inflight.take().expect("in-flight entry");
                    done.push((*shard, inf, out));
                }
            }
        }
        let progressed = !done.is_empty();
        for (shard, inf, (conn, res)) in done {
            self.finish(shard, inf, conn, res);
        }

        let preamble = self.pool.preamble();
        let timeout = self.config.statement_timeout;
        for ch in self.channels.values_mut() {
            if ch.inflight.is_none() && ch.conn.is_some() && !ch.queue.is_empty() && !ch.blocked()
            {
                Self::launch(ch, &preamble, timeout);
            }
        }
        progressed
    }

    /// Cancel the statement: drop every in-flight round trip (tearing the
    /// connection down), issue `KILL QUERY` for each from a fresh
    /// connection, fail everything still queued, and schedule topology
    /// re-checks for every shard touched.
    pub async fn cancel_all(&mut self) {
        let mut kills: Vec<(ShardId, NodeId, u32)> = Vec::new();
        for (shard, ch) in self.channels.iter_mut() {
            if let Some(inf) = ch.inflight.take() {
                inf.handle.fail(DispatchError::Cancelled);
                kills.push((*shard, inf.node, inf.conn_id));
            }
            for (_, handle) in ch.queue.drain(..) {
                handle.fail(DispatchError::Cancelled);
            }
            if let Some(handle) = ch.held.take() {
                handle.release_result();
            }
            self.runtime.request_topology_check(*shard);
        }

        for (shard, node, conn_id) in kills {
            self.pool.invalidate(shard, node);
            match self.pool.acquire(shard, Target::Master).await {
                // Utility command, skips the session preamble.
                Ok(mut conn) => {
                    let stmt = format!("KILL QUERY {conn_id}");
                    match conn.session.round_trip(&stmt).await {
                        Ok(_) => {
                            let (shard, node) = (conn.shard, conn.node);
                            self.pool.release(conn);
                            // The session never saw the preamble; it must go
                            // out ahead of the next transactional statement.
                            self.pool.mark_reset(shard, node);
                        }
                        Err(err) => {
                            tracing::warn!(%shard, error = %err, "kill query failed");
                            self.pool.discard(conn);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%shard, error = %err, "could not reconnect to kill query");
                }
            }
        }
    }

    /// Drop statements still waiting in queues without touching anything
    /// in flight. Abort path, before rollback statements go out.
    pub fn drop_queued(&mut self) {
        for ch in self.channels.values_mut() {
            for (_, handle) in ch.queue.drain(..) {
                handle.fail(DispatchError::Cancelled);
            }
        }
    }

    /// Park all channel connections back into the pool and clear
    /// per-transaction state. Called once the owning transaction resolves.
    pub fn finish_txn(&mut self) {
        for (_, mut ch) in std::mem::take(&mut self.channels) {
            if let Some(handle) = ch.held.take() {
                handle.release_result();
            }
            if let Some(inf) = ch.inflight.take() {
                inf.handle.fail(DispatchError::Cancelled);
            }
            for (_, handle) in ch.queue.drain(..) {
                handle.fail(DispatchError::Cancelled);
            }
            if let Some(conn) = ch.conn.take() {
                self.pool.release(conn);
            }
        }
        self.txn_affected_rows = 0;
    }

    fn any_inflight(&self) -> bool {
        self.channels.values().any(|c| c.inflight.is_some())
    }

    fn has_outstanding(&self) -> bool {
        self.channels
            .values()
            .any(|c| c.inflight.is_some() || !c.queue.is_empty())
    }

    /// Auto-release undrained results that are blocking queued work.
    fn release_blocking_results(&mut self) -> bool {
        let mut released = false;
        for ch in self.channels.values_mut() {
            if !ch.queue.is_empty() && ch.blocked() {
                if let Some(handle) = ch.held.take() {
                    handle.release_result();
                    released = true;
                }
            }
        }
        released
    }

    /// Launch the next job on every idle, unblocked channel, connecting as
    /// needed. Returns the first connect failure.
    async fn start_ready(&mut self) -> Option<DispatchError> {
        let mut first_err = None;
        let shards: Vec<ShardId> = self.channels.keys().copied().collect();
        for shard in shards {
            {
                let ch = self.channels.get_mut(&shard).expect("known channel");
                if ch.inflight.is_some() || ch.queue.is_empty() || ch.blocked() {
                    continue;
                }
            }
            if self.channels[&shard].conn.is_none() {
                match self.pool.acquire(shard, Target::Master).await {
                    Ok(conn) => {
                        self.channels.get_mut(&shard).expect("known channel").conn = Some(conn);
                    }
                    Err(err) => {
                        let err = DispatchError::from(err);
                        tracing::warn!(%shard, error = %err, "connect failed for queued statement");
                        let ch = self.channels.get_mut(&shard).expect("known channel");
                        for (_, handle) in ch.queue.drain(..) {
                            handle.fail(err.clone());
                        }
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                        continue;
                    }
                }
            }
            let preamble = self.pool.preamble();
            let timeout = self.config.statement_timeout;
            let ch = self.channels.get_mut(&shard).expect("known channel");
            Self::launch(ch, &preamble, timeout);
        }
        first_err
    }

    /// Move the channel's front job into flight. The round-trip future owns
    /// the connection and returns it alongside the result.
    fn launch(ch: &mut Channel, preamble: &Preamble, timeout: Duration) {
        let (job, handle) = match ch.queue.pop_front() {
            Some(entry) => entry,
            None => return,
        };
        let mut conn = match ch.conn.take() {
            Some(conn) => conn,
            None => {
                handle.fail(DispatchError::Internal(
                    "job launched without a connection".to_string(),
                ));
                return;
            }
        };
        let (batch, preamble_len, primary_probe) = if conn.needs_preamble {
            conn.needs_preamble = false;
            (
                preamble.prepend_to(&job.sql),
                preamble.len(),
                preamble.primary_probe(),
            )
        } else {
            (job.sql.clone(), 0, None)
        };
        handle.mark_inflight();
        let conn_id = conn.connection_id();
        let node = conn.node;
        let fut: RoundTrip = Box::pin(async move {
            let res = conn.session.round_trip(&batch).await;
            (conn, res)
        });
        ch.inflight = Some(InFlight {
            fut,
            conn_id,
            node,
            handle,
            kind: job.kind,
            ignore_error: job.ignore_error,
            preamble_len,
            primary_probe,
            deadline: Instant::now() + timeout,
        });
    }

    /// Wait for one in-flight round trip, the detector-wake point, or the
    /// nearest deadline, whichever comes first.
    async fn await_one(&mut self, wake_at: Option<Instant>) -> WaitOutcome {
        enum Raced {
            Done(
                ShardId,
                InFlight,
                (PooledConn, tessera_pool::Result<Vec<Reply>>),
            ),
            Wake,
            Deadline,
        }

        let deadline = self
            .channels
            .values()
            .filter_map(|c| c.inflight.as_ref().map(|f| f.deadline))
            .min()
            .expect("await_one called with work in flight");

        let channels = &mut self.channels;
        let raced = tokio::select! {
            biased;
            done = poll_fn(|cx| {
                for (shard, ch) in channels.iter_mut() {
                    if let Some(inf) = ch.inflight.as_mut() {
                        if let Poll::Ready(out) = inf.fut.as_mut().poll(cx) {
                            let inf = ch.inflight.take().expect("in-flight entry");
                            return Poll::Ready((*shard, inf, out));
                        }
                    }
                }
                Poll::Pending
            }) => {
                let (shard, inf, out) = done;
                Raced::Done(shard, inf, out)
            }
            _ = tokio::time::sleep_until(wake_at.unwrap_or(deadline)), if wake_at.is_some() => Raced::Wake,
            _ = tokio::time::sleep_until(deadline) => Raced::Deadline,
        };

        match raced {
            Raced::Done(shard, inf, (conn, res)) => {
                self.finish(shard, inf, conn, res);
                WaitOutcome::Completed
            }
            Raced::Wake => WaitOutcome::WakeDetector,
            Raced::Deadline => WaitOutcome::Deadline,
        }
    }

    /// Record the outcome of a completed round trip and decide the fate of
    /// the connection: transport and preamble failures tear it down, SQL
    /// errors leave it healthy.
    fn finish(
        &mut self,
        shard: ShardId,
        inf: InFlight,
        conn: PooledConn,
        res: tessera_pool::Result<Vec<Reply>>,
    ) {
        let replies = match res {
            Ok(replies) => replies,
            Err(err) => {
                tracing::warn!(%shard, error = %err, "round trip failed, tearing down connection");
                self.pool.discard(conn);
                let err = DispatchError::from(err);
                self.flush_err.get_or_insert(err.clone());
                inf.handle.fail(err);
                self.fail_queue(shard);
                return;
            }
        };

        for reply in replies.iter().take(inf.preamble_len) {
            if let Reply::Err(err) = reply {
                tracing::warn!(%shard, %err, "session preamble rejected");
                self.pool.discard(conn);
                let err = DispatchError::Server {
                    shard,
                    error: err.clone(),
                };
                self.flush_err.get_or_insert(err.clone());
                inf.handle.fail(err);
                self.fail_queue(shard);
                return;
            }
        }
        if let Some(ix) = inf.primary_probe {
            let read_only = match replies.get(ix) {
                Some(Reply::Rows(rows)) => {
                    rows.first().and_then(|r| r.first()).and_then(|c| c.as_deref()) == Some("1")
                }
                _ => false,
            };
            if read_only {
                let node = conn.node;
                tracing::warn!(%shard, %node, "connected node is no longer the primary");
                self.pool.discard(conn);
                let err = DispatchError::from(PoolError::StaleTopology { shard, node });
                self.flush_err.get_or_insert(err.clone());
                inf.handle.fail(err);
                self.fail_queue(shard);
                return;
            }
        }

        let payload = &replies[inf.preamble_len.min(replies.len())..];
        if payload.is_empty() {
            self.pool.discard(conn);
            let err = DispatchError::from(PoolError::Protocol {
                shard,
                reason: "missing statement reply".to_string(),
            });
            self.flush_err.get_or_insert(err.clone());
            inf.handle.fail(err);
            self.fail_queue(shard);
            return;
        }

        let mut affected = 0u64;
        let mut warnings = 0u32;
        let mut rows: Option<Vec<Row>> = None;
        let mut server_err: Option<ServerError> = None;
        for reply in payload {
            match reply {
                Reply::Done {
                    affected_rows,
                    warnings: w,
                } => {
                    affected += *affected_rows;
                    warnings += *w;
                }
                Reply::Rows(r) => rows = Some(r.clone()),
                Reply::Err(err) => {
                    if inf.ignore_error == Some(err.code) {
                        tracing::debug!(%shard, code = err.code, "ignored expected server error");
                    } else if server_err.is_none() {
                        server_err = Some(err.clone());
                    }
                }
            }
        }

        if server_err.is_none() && matches!(inf.kind, CommandKind::Write) {
            self.txn_affected_rows += affected;
        }
        let ch = self
            .channels
            .get_mut(&shard)
            .expect("channel for finished round trip");
        ch.conn = Some(conn);
        match server_err {
            Some(error) => inf.handle.fail(DispatchError::Server { shard, error }),
            None => {
                let had_rows = rows.is_some();
                inf.handle.complete(affected, warnings, rows);
                if had_rows {
                    ch.held = Some(inf.handle.clone());
                }
            }
        }
    }

    /// A torn-down connection dooms whatever is queued behind it.
    fn fail_queue(&mut self, shard: ShardId) {
        if let Some(ch) = self.channels.get_mut(&shard) {
            for (_, handle) in ch.queue.drain(..) {
                handle.fail(DispatchError::Cancelled);
            }
            ch.held = None;
        }
    }
}
