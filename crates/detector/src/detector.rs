//! Detector task
//!
//! Runs as an independent tokio task with its own pool and dispatcher.
//! Each pass polls every reachable shard's lock-wait view, rebuilds the
//! wait-for graph, and kills one victim per cross-shard cycle. Pass
//! failures are logged and backed off; they never reach user transactions.

use crate::diag::{self, DIAG_QUERY};
use crate::error::Result;
use crate::graph::WaitGraph;
use crate::policy::{self, VictimPolicy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tessera_common::{ClusterRuntime, CommandKind, GlobalTxnId, ShardId};
use tessera_dispatch::{Dispatcher, JobStatus, StatementJob};

/// Tunables for the detector task.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Sleep between passes, absent wake requests.
    pub naptime: Duration,
    pub victim_policy: VictimPolicy,
    /// Substring the shard version string must carry for the diagnostic
    /// views to exist.
    pub engine_family_marker: String,
    /// Minimum sleep after a failed pass.
    pub min_backoff: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            naptime: Duration::from_secs(5),
            victim_policy: VictimPolicy::YoungestStart,
            engine_family_marker: "tessera-storage".to_string(),
            min_backoff: Duration::from_secs(1),
        }
    }
}

/// What one detector pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub shards_polled: usize,
    pub shards_skipped: usize,
    pub victims: Vec<GlobalTxnId>,
    pub kills: usize,
}

/// The global deadlock detector.
pub struct DeadlockDetector {
    runtime: Arc<ClusterRuntime>,
    dispatcher: Dispatcher,
    config: DetectorConfig,
    /// Version probe result, cached after the first reachable shard answers.
    supported: Option<bool>,
    /// Branch identities killed in earlier passes, remembered while they
    /// remain in the diagnostic view.
    recently_killed: HashSet<(GlobalTxnId, ShardId, u32)>,
}

impl DeadlockDetector {
    pub fn new(runtime: Arc<ClusterRuntime>, dispatcher: Dispatcher, config: DetectorConfig) -> Self {
        Self {
            runtime,
            dispatcher,
            config,
            supported: None,
            recently_killed: HashSet::new(),
        }
    }

    /// Timer- and wake-driven pass loop. Never returns.
    pub async fn run(mut self) {
        tracing::info!(naptime = ?self.config.naptime, "deadlock detector running");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.naptime) => {}
                _ = self.runtime.detector_wakeup() => {
                    let requests = self.runtime.take_wake_requests();
                    tracing::debug!(requests, "woken ahead of schedule");
                }
            }
            match self.run_pass().await {
                Ok(report) if !report.victims.is_empty() => {
                    tracing::info!(
                        victims = report.victims.len(),
                        kills = report.kills,
                        "deadlock victims killed"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "detector pass failed");
                    tokio::time::sleep(self.config.min_backoff).await;
                }
            }
        }
    }

    /// One full pass: build the graph, find cross-shard cycles, kill one
    /// victim per cycle.
    pub async fn run_pass(&mut self) -> Result<PassReport> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.runtime.note_detector_pass(now);
        // Clears anything a failed previous pass left queued.
        self.dispatcher.finish_txn();

        let shards = self.dispatcher.pool_mut().topology().all_shards();
        let mut report = PassReport::default();
        // A single-shard cluster cannot deadlock across shards.
        if shards.len() < 2 {
            return Ok(report);
        }
        if !self.engine_supported(&shards).await {
            report.shards_skipped = shards.len();
            return Ok(report);
        }

        let mut handles = Vec::new();
        for &shard in &shards {
            handles.push((
                shard,
                self.dispatcher
                    .enqueue(shard, StatementJob::new(DIAG_QUERY, CommandKind::Read)),
            ));
        }
        if let Err(err) = self.dispatcher.flush_all().await {
            // Unreachable shards sit out this round; the rest still count.
            tracing::debug!(error = %err, "shard unreachable during graph build");
        }

        let mut graph = WaitGraph::new();
        let mut visible = HashSet::new();
        for (shard, handle) in handles {
            if handle.status() != JobStatus::Done {
                report.shards_skipped += 1;
                continue;
            }
            report.shards_polled += 1;
            let mut rows = Vec::new();
            while let Some(row) = handle.fetch_row() {
                rows.push(row);
            }
            for diag in diag::parse_rows(&rows) {
                visible.insert((diag.waiter.txn, shard, diag.waiter.conn_id));
                visible.insert((diag.blocker.txn, shard, diag.blocker.conn_id));
                graph.add_observation(shard, &diag);
            }
        }

        // Kills from earlier passes stay remembered while the branch is
        // still in the view; an unchanged lock state never re-kills.
        self.recently_killed
            .retain(|identity| visible.contains(identity));

        let mut stamps = vec![None; graph.txn_count()];
        for start in 0..graph.txn_count() {
            let cycle = match graph.find_cycle_from(start, &mut stamps) {
                Some(cycle) => cycle,
                None => continue,
            };
            if graph.cycle_shards(&cycle).len() < 2 {
                tracing::debug!("single-shard cycle left to the shard's own handling");
                continue;
            }
            let txns = graph.cycle_txns(&cycle);
            let kill_in_flight = txns.iter().any(|&ix| {
                let id = graph.txn(ix).id;
                graph
                    .branches_of(ix)
                    .any(|b| self.recently_killed.contains(&(id, b.shard, b.conn_id)))
            });
            if kill_in_flight {
                tracing::debug!("cycle already has a kill in flight");
                continue;
            }
            let victim = match policy::select_victim(self.config.victim_policy, &graph, &txns) {
                Some(victim) => victim,
                None => continue,
            };

            let killed = self.kill_victim(&graph, victim).await?;
            graph.mark_killed(victim, killed.len() as u32);
            report.kills += killed.len();
            report.victims.push(graph.txn(victim).id);
            tracing::info!(victim = %graph.txn(victim).id, branches = killed.len(), "deadlock victim chosen");
            self.recently_killed.extend(killed);
        }

        self.dispatcher.finish_txn();
        Ok(report)
    }

    /// `KILL QUERY` every branch of the victim on its own shard. Returns
    /// the branch identities actually killed.
    async fn kill_victim(
        &mut self,
        graph: &WaitGraph,
        victim: usize,
    ) -> Result<Vec<(GlobalTxnId, ShardId, u32)>> {
        let id = graph.txn(victim).id;
        let targets: Vec<(ShardId, u32)> = graph
            .branches_of(victim)
            .map(|b| (b.shard, b.conn_id))
            .collect();
        let mut handles = Vec::new();
        for &(shard, conn_id) in &targets {
            handles.push((
                (shard, conn_id),
                self.dispatcher.enqueue(
                    shard,
                    StatementJob::new(format!("KILL QUERY {conn_id}"), CommandKind::TxnControl),
                ),
            ));
        }
        self.dispatcher.flush_all().await?;

        let mut killed = Vec::new();
        for ((shard, conn_id), handle) in handles {
            if handle.status() == JobStatus::Done {
                killed.push((id, shard, conn_id));
            } else {
                tracing::warn!(victim = %id, %shard, conn_id, "kill not delivered");
            }
        }
        Ok(killed)
    }

    /// Cached version probe against the first reachable shard.
    async fn engine_supported(&mut self, shards: &[ShardId]) -> bool {
        if let Some(supported) = self.supported {
            return supported;
        }
        for &shard in shards {
            let handle = self
                .dispatcher
                .enqueue(shard, StatementJob::new("SELECT version()", CommandKind::Read));
            if let Err(err) = self.dispatcher.flush_all().await {
                tracing::debug!(%shard, error = %err, "version probe failed");
            }
            if handle.status() != JobStatus::Done {
                continue;
            }
            let version = handle
                .fetch_row()
                .and_then(|row| row.into_iter().next())
                .flatten()
                .unwrap_or_default();
            let supported = diag::version_supported(&version, &self.config.engine_family_marker);
            if !supported {
                tracing::warn!(%shard, %version, "storage engine lacks lock-wait diagnostics, detector disabled");
            }
            self.supported = Some(supported);
            return supported;
        }
        // Nothing reachable; probe again next pass.
        false
    }
}
