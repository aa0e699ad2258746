//! Core coordinator implementation
//!
//! One coordinator per backend flow. It owns the flow's dispatcher, tracks
//! which shard branches a transaction has touched and how, and resolves the
//! transaction with XA one-phase or two-phase commit depending on how many
//! branches actually changed rows.

use crate::branch::TransactionBranch;
use crate::error::{CoordinatorError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_common::{savepoint_name, ClusterRuntime, CommandKind, GlobalTxnId, ShardId};
use tessera_dispatch::{Dispatcher, JobHandle, JobStatus, StatementJob};

/// How a transaction was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// At most one branch changed rows; every branch committed `ONE PHASE`.
    OnePhase,
    /// Two or more branches changed rows; full prepare/commit ran.
    TwoPhase,
}

struct ActiveTxn {
    id: GlobalTxnId,
    branches: BTreeMap<ShardId, TransactionBranch>,
    /// Statements sent but not yet accounted against their branches.
    pending: Vec<(ShardId, CommandKind, JobHandle)>,
    next_savepoint: u32,
}

/// Distributed transaction coordinator for one backend flow.
pub struct TxnCoordinator {
    runtime: Arc<ClusterRuntime>,
    dispatcher: Dispatcher,
    next_local_txn: u32,
    current: Option<ActiveTxn>,
}

impl TxnCoordinator {
    pub fn new(runtime: Arc<ClusterRuntime>, dispatcher: Dispatcher) -> Self {
        Self {
            runtime,
            dispatcher,
            next_local_txn: 0,
            current: None,
        }
    }

    pub fn current_txn(&self) -> Option<GlobalTxnId> {
        self.current.as_ref().map(|t| t.id)
    }

    /// Rows changed so far by the active transaction's write statements.
    pub fn txn_affected_rows(&self) -> u64 {
        self.dispatcher.txn_affected_rows()
    }

    pub fn request_topology_check(&self, shard: ShardId) {
        self.runtime.request_topology_check(shard);
    }

    /// Start a new global transaction.
    pub fn begin(&mut self) -> Result<GlobalTxnId> {
        if self.current.is_some() {
            return Err(CoordinatorError::InvalidState(
                "a transaction is already active".to_string(),
            ));
        }
        let start_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.next_local_txn = self.next_local_txn.wrapping_add(1);
        let id = GlobalTxnId::new(self.runtime.comp_node(), start_ts, self.next_local_txn);
        self.current = Some(ActiveTxn {
            id,
            branches: BTreeMap::new(),
            pending: Vec::new(),
            next_savepoint: 0,
        });
        tracing::debug!(txn = %id, "transaction started");
        Ok(id)
    }

    /// Register a shard as a branch of the active transaction. Idempotent;
    /// also done implicitly by [`Self::enqueue`].
    pub fn begin_branch(&mut self, shard: ShardId) -> Result<()> {
        let txn = self
            .current
            .as_mut()
            .ok_or(CoordinatorError::NoActiveTransaction)?;
        txn.branches
            .entry(shard)
            .or_insert_with(|| TransactionBranch::new(shard));
        Ok(())
    }

    /// Queue a statement against one branch of the active transaction.
    pub fn enqueue(
        &mut self,
        shard: ShardId,
        sql: impl Into<String>,
        kind: CommandKind,
        ignore_error: Option<u32>,
    ) -> Result<JobHandle> {
        let txn = self
            .current
            .as_mut()
            .ok_or(CoordinatorError::NoActiveTransaction)?;
        txn.branches
            .entry(shard)
            .or_insert_with(|| TransactionBranch::new(shard));
        let mut job = StatementJob::new(sql, kind);
        job.ignore_error = ignore_error;
        let handle = self.dispatcher.enqueue(shard, job);
        txn.pending.push((shard, kind, handle.clone()));
        Ok(handle)
    }

    /// Drive every queued statement to completion and account the results
    /// against their branches. Returns the first failure; completed
    /// statements are accounted either way.
    pub async fn flush_all(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Err(CoordinatorError::NoActiveTransaction);
        }
        let res = self.dispatcher.flush_all().await;

        let mut first_fail = None;
        if let Some(txn) = self.current.as_mut() {
            for (shard, kind, handle) in txn.pending.drain(..) {
                match handle.status() {
                    JobStatus::Done => {
                        if let Some(branch) = txn.branches.get_mut(&shard) {
                            branch.note_access(kind, handle.affected_rows());
                        }
                    }
                    JobStatus::Failed => {
                        if first_fail.is_none() {
                            first_fail = handle.error();
                        }
                    }
                    _ => {}
                }
            }
        }

        res?;
        match first_fail {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Commit the active transaction. Branches that changed no rows commit
    /// one-phase; with two or more written branches a full prepare/commit
    /// runs and the outcome says so.
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        let (id, accessed, written, ddl_count) = {
            let txn = self
                .current
                .as_ref()
                .ok_or(CoordinatorError::NoActiveTransaction)?;
            if !txn.pending.is_empty() {
                return Err(CoordinatorError::InvalidState(
                    "commit with unflushed statements".to_string(),
                ));
            }
            let accessed: Vec<ShardId> = txn
                .branches
                .values()
                .filter(|b| b.accessed())
                .map(|b| b.shard)
                .collect();
            let written: Vec<ShardId> = txn
                .branches
                .values()
                .filter(|b| b.wrote_rows())
                .map(|b| b.shard)
                .collect();
            let ddl_count = txn.branches.values().filter(|b| b.executed_ddl).count();
            (txn.id, accessed, written, ddl_count)
        };

        // DDL cannot be mixed with other participants; the storage engines
        // cannot atomically resolve a multi-shard schema change.
        if ddl_count > 0 && accessed.len() > 1 {
            self.current = None;
            self.dispatcher.finish_txn();
            self.dispatcher.pool_mut().disconnect_all();
            return Err(CoordinatorError::InternalInvariant(format!(
                "transaction {id} ran ddl but spans {} shards",
                accessed.len()
            )));
        }

        // A branch already gone before phase one means the transaction
        // cannot be made atomic; abort everything that is left.
        if let Some(&shard) = accessed.iter().find(|s| !self.dispatcher.is_connected(**s)) {
            tracing::warn!(txn = %id, %shard, "shard lost before commit, aborting");
            self.rollback(false).await?;
            return Err(CoordinatorError::TxnAborted {
                txn: id,
                reason: format!("shard {shard} disconnected before commit"),
            });
        }

        if written.len() <= 1 {
            self.commit_one_phase(id, &accessed).await
        } else {
            self.commit_two_phase(id, &accessed, &written).await
        }
    }

    async fn commit_one_phase(&mut self, id: GlobalTxnId, accessed: &[ShardId]) -> Result<CommitOutcome> {
        let mut handles = Vec::new();
        for &shard in accessed {
            let sql = format!("XA END '{id}';XA COMMIT '{id}' ONE PHASE");
            handles.push((
                shard,
                self.dispatcher
                    .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl)),
            ));
        }
        let res = self.dispatcher.flush_all().await;

        let mut reason = None;
        if let Err(err) = res {
            reason = Some(err.to_string());
        }
        for (shard, handle) in &handles {
            if handle.status() == JobStatus::Failed {
                let detail = handle
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                reason.get_or_insert(format!("one-phase commit failed on shard {shard}: {detail}"));
            }
        }
        if let Some(reason) = reason {
            self.cleanup_after_failure(accessed);
            return Err(CoordinatorError::TxnAborted { txn: id, reason });
        }

        self.finish();
        tracing::debug!(txn = %id, "committed one-phase");
        Ok(CommitOutcome::OnePhase)
    }

    async fn commit_two_phase(
        &mut self,
        id: GlobalTxnId,
        accessed: &[ShardId],
        written: &[ShardId],
    ) -> Result<CommitOutcome> {
        // Phase one. Read-only branches have nothing at stake and finish
        // one-phase alongside the prepares.
        let mut prepares = Vec::new();
        for &shard in accessed {
            if written.contains(&shard) {
                let sql = format!("XA END '{id}';XA PREPARE '{id}'");
                prepares.push((
                    shard,
                    self.dispatcher
                        .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl)),
                ));
            } else {
                let sql = format!("XA END '{id}';XA COMMIT '{id}' ONE PHASE");
                self.dispatcher
                    .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl));
            }
        }
        let res = self.dispatcher.flush_all().await;

        let mut failed: Option<(ShardId, String)> = None;
        for (shard, handle) in &prepares {
            if handle.status() != JobStatus::Done {
                let detail = handle
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no vote".to_string());
                failed = Some((*shard, detail));
                break;
            }
        }
        if let Err(err) = &res {
            tracing::warn!(txn = %id, error = %err, "phase one flush failed");
        }
        if failed.is_some() || res.is_err() {
            // Roll back every written branch still reachable; the rest are
            // treated as already aborted.
            for &shard in written {
                if self.dispatcher.is_connected(shard) {
                    let sql = format!("XA ROLLBACK '{id}'");
                    self.dispatcher
                        .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl));
                }
            }
            if let Err(err) = self.dispatcher.flush_all().await {
                tracing::warn!(txn = %id, error = %err, "rollback after failed prepare");
            }
            self.cleanup_after_failure(accessed);
            return match failed {
                Some((shard, reason)) => Err(CoordinatorError::PrepareFailed { shard, reason }),
                None => Err(CoordinatorError::TxnAborted {
                    txn: id,
                    reason: "phase one flush failed".to_string(),
                }),
            };
        }

        // Phase two. Every branch is prepared; commit is now the only legal
        // outcome. Delivery failures here are logged and left to the
        // storage engines' XA recovery.
        let mut commits = Vec::new();
        for &shard in written {
            let sql = format!("XA COMMIT '{id}'");
            commits.push((
                shard,
                self.dispatcher
                    .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl)),
            ));
        }
        if let Err(err) = self.dispatcher.flush_all().await {
            tracing::warn!(txn = %id, error = %err, "phase two delivery failed");
        }
        for (shard, handle) in &commits {
            if handle.status() == JobStatus::Failed {
                tracing::warn!(txn = %id, %shard, "commit not acknowledged, left to xa recovery");
            }
        }

        self.finish();
        tracing::debug!(txn = %id, participants = written.len(), "committed two-phase");
        Ok(CommitOutcome::TwoPhase)
    }

    /// Abort the active transaction. `partial` marks a statement-level
    /// abort where work may still be in flight; it is cancelled first.
    /// Rollback itself never fails the caller: errors are logged, then
    /// every remaining connection is hard-disconnected and topology
    /// re-checks scheduled.
    pub async fn rollback(&mut self, partial: bool) -> Result<()> {
        let txn = self
            .current
            .take()
            .ok_or(CoordinatorError::NoActiveTransaction)?;
        let id = txn.id;
        if partial {
            self.dispatcher.cancel_all().await;
        }
        self.dispatcher.drop_queued();

        let mut handles = Vec::new();
        for branch in txn.branches.values() {
            if !branch.accessed() {
                continue;
            }
            if !self.dispatcher.is_connected(branch.shard) {
                tracing::debug!(txn = %id, shard = %branch.shard, "disconnected branch treated as rolled back");
                continue;
            }
            let sql = format!("XA END '{id}';XA ROLLBACK '{id}'");
            handles.push((
                branch.shard,
                self.dispatcher
                    .enqueue(branch.shard, StatementJob::new(sql, CommandKind::TxnControl)),
            ));
        }

        let mut had_error = false;
        if let Err(err) = self.dispatcher.flush_all().await {
            tracing::warn!(txn = %id, error = %err, "rollback flush failed");
            had_error = true;
        }
        for (shard, handle) in &handles {
            if handle.status() == JobStatus::Failed {
                tracing::warn!(txn = %id, %shard, "rollback rejected by shard");
                had_error = true;
            }
        }

        if had_error {
            // Connections may hold undefined transactional state.
            for shard in txn.branches.keys() {
                self.runtime.request_topology_check(*shard);
            }
            self.dispatcher.finish_txn();
            self.dispatcher.pool_mut().disconnect_all();
        } else {
            self.dispatcher.finish_txn();
        }
        tracing::debug!(txn = %id, "transaction rolled back");
        Ok(())
    }

    /// Create the next savepoint on every branch; returns its name.
    pub async fn savepoint_begin(&mut self) -> Result<String> {
        let name = {
            let txn = self
                .current
                .as_mut()
                .ok_or(CoordinatorError::NoActiveTransaction)?;
            txn.next_savepoint += 1;
            savepoint_name(txn.next_savepoint)
        };
        self.broadcast(&format!("SAVEPOINT {name}")).await?;
        Ok(name)
    }

    pub async fn savepoint_release(&mut self, name: &str) -> Result<()> {
        self.broadcast(&format!("RELEASE SAVEPOINT {name}")).await
    }

    pub async fn savepoint_rollback(&mut self, name: &str) -> Result<()> {
        self.broadcast(&format!("ROLLBACK TO {name}")).await
    }

    /// Send one transaction-control statement to every registered branch
    /// and wait for all of them.
    async fn broadcast(&mut self, sql: &str) -> Result<()> {
        let shards: Vec<ShardId> = {
            let txn = self
                .current
                .as_ref()
                .ok_or(CoordinatorError::NoActiveTransaction)?;
            txn.branches.keys().copied().collect()
        };
        let mut handles = Vec::new();
        for shard in shards {
            handles.push((
                shard,
                self.dispatcher
                    .enqueue(shard, StatementJob::new(sql, CommandKind::TxnControl)),
            ));
        }
        self.dispatcher.flush_all().await?;
        for (shard, handle) in handles {
            if handle.status() == JobStatus::Failed {
                return Err(handle.error().map(CoordinatorError::from).unwrap_or_else(
                    || {
                        CoordinatorError::InvalidState(format!(
                            "transaction control lost on shard {shard}"
                        ))
                    },
                ));
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.current = None;
        self.dispatcher.finish_txn();
    }

    /// Commit outcome unknown on some branch: drop everything and force
    /// topology re-checks before this flow touches the cluster again.
    fn cleanup_after_failure(&mut self, shards: &[ShardId]) {
        for &shard in shards {
            self.runtime.request_topology_check(shard);
        }
        self.current = None;
        self.dispatcher.finish_txn();
        self.dispatcher.pool_mut().disconnect_all();
    }
}
