//! Wait-for graph
//!
//! Rebuilt from scratch every pass. Branch observations from all shards
//! are merged per global transaction id (summed row counts over distinct
//! branches, minimum start time), giving one node per global transaction,
//! one branch record per (transaction, shard), and one edge per
//! waiter/blocker row.

use crate::diag::{BranchObservation, DiagRow};
use std::collections::{BTreeSet, HashMap};
use tessera_common::{GlobalTxnId, ShardId};

/// One global transaction as merged from every shard that reported it.
#[derive(Debug)]
pub struct GlobalTxn {
    pub id: GlobalTxnId,
    /// Earliest branch start time.
    pub start_ts: i64,
    /// Rows changed, summed over distinct branches.
    pub rows_changed: u64,
    /// Rows locked, summed over distinct branches.
    pub rows_locked: u64,
    /// Incoming wait edges: how many transactions this one blocks.
    pub blocking: u32,
    /// Outgoing wait edges: how many transactions block this one.
    pub blocked_by: u32,
    /// Branches killed this pass; outranks any victim policy.
    pub killed_branches: u32,
    branches: Vec<usize>,
}

/// One shard's branch of a global transaction.
#[derive(Debug)]
pub struct TxnBranch {
    pub txn: usize,
    pub shard: ShardId,
    pub conn_id: u32,
}

/// One waiter→blocker observation.
#[derive(Debug)]
pub struct WaitEdge {
    pub waiter: usize,
    pub blocker: usize,
    pub shard: ShardId,
}

#[derive(Default)]
pub struct WaitGraph {
    txns: Vec<GlobalTxn>,
    branches: Vec<TxnBranch>,
    edges: Vec<WaitEdge>,
    out_edges: Vec<Vec<usize>>,
    by_id: HashMap<GlobalTxnId, usize>,
    branch_ix: HashMap<(usize, ShardId), usize>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn txn_count(&self) -> usize {
        self.txns.len()
    }

    pub fn txn(&self, ix: usize) -> &GlobalTxn {
        &self.txns[ix]
    }

    pub fn edge(&self, ix: usize) -> &WaitEdge {
        &self.edges[ix]
    }

    pub fn branches_of(&self, txn: usize) -> impl Iterator<Item = &TxnBranch> {
        self.txns[txn].branches.iter().map(|&b| &self.branches[b])
    }

    pub fn mark_killed(&mut self, txn: usize, branches: u32) {
        self.txns[txn].killed_branches += branches;
    }

    /// Fold one waiter/blocker row from a shard into the graph.
    pub fn add_observation(&mut self, shard: ShardId, row: &DiagRow) {
        let waiter = self.observe(shard, &row.waiter);
        let blocker = self.observe(shard, &row.blocker);
        let edge_ix = self.edges.len();
        self.edges.push(WaitEdge {
            waiter,
            blocker,
            shard,
        });
        self.out_edges[waiter].push(edge_ix);
        self.txns[waiter].blocked_by += 1;
        self.txns[blocker].blocking += 1;
    }

    fn observe(&mut self, shard: ShardId, obs: &BranchObservation) -> usize {
        let txn_ix = match self.by_id.get(&obs.txn) {
            Some(&ix) => {
                let txn = &mut self.txns[ix];
                txn.start_ts = txn.start_ts.min(obs.start_ts);
                ix
            }
            None => {
                let ix = self.txns.len();
                self.txns.push(GlobalTxn {
                    id: obs.txn,
                    start_ts: obs.start_ts,
                    rows_changed: 0,
                    rows_locked: 0,
                    blocking: 0,
                    blocked_by: 0,
                    killed_branches: 0,
                    branches: Vec::new(),
                });
                self.out_edges.push(Vec::new());
                self.by_id.insert(obs.txn, ix);
                ix
            }
        };
        // Row counts fold in once per distinct branch, not per row.
        if !self.branch_ix.contains_key(&(txn_ix, shard)) {
            let branch = self.branches.len();
            self.branches.push(TxnBranch {
                txn: txn_ix,
                shard,
                conn_id: obs.conn_id,
            });
            self.branch_ix.insert((txn_ix, shard), branch);
            let txn = &mut self.txns[txn_ix];
            txn.branches.push(branch);
            txn.rows_changed += obs.rows_changed;
            txn.rows_locked += obs.rows_locked;
        }
        txn_ix
    }

    /// Distinct shards touched by a cycle's edges.
    pub fn cycle_shards(&self, cycle: &[usize]) -> BTreeSet<ShardId> {
        cycle.iter().map(|&e| self.edges[e].shard).collect()
    }

    /// The transactions on a cycle, in path order, deduplicated.
    pub fn cycle_txns(&self, cycle: &[usize]) -> Vec<usize> {
        let mut txns = Vec::with_capacity(cycle.len());
        for &e in cycle {
            for ix in [self.edges[e].waiter, self.edges[e].blocker] {
                if !txns.contains(&ix) {
                    txns.push(ix);
                }
            }
        }
        txns
    }

    /// Depth-first search for one wait cycle reachable from `start`.
    /// Iterative, explicit stack; `stamps` carries the visiting start node
    /// so traversals within one pass never re-enter finished territory.
    /// Returns the cycle as edge indices.
    pub fn find_cycle_from(&self, start: usize, stamps: &mut [Option<usize>]) -> Option<Vec<usize>> {
        struct Frame {
            txn: usize,
            next_out: usize,
            in_edge: Option<usize>,
        }

        if stamps[start].is_some() {
            return None;
        }
        let mut on_path = vec![false; self.txns.len()];
        let mut stack = vec![Frame {
            txn: start,
            next_out: 0,
            in_edge: None,
        }];
        stamps[start] = Some(start);
        on_path[start] = true;

        loop {
            let (txn, next) = {
                let top = match stack.last_mut() {
                    Some(top) => top,
                    None => break,
                };
                let next = self.out_edges[top.txn].get(top.next_out).copied();
                if next.is_some() {
                    top.next_out += 1;
                }
                (top.txn, next)
            };
            match next {
                Some(edge_ix) => {
                    let blocker = self.edges[edge_ix].blocker;
                    if on_path[blocker] {
                        let pos = stack
                            .iter()
                            .position(|f| f.txn == blocker)
                            .expect("cycle node on path");
                        let mut cycle: Vec<usize> =
                            stack[pos + 1..].iter().filter_map(|f| f.in_edge).collect();
                        cycle.push(edge_ix);
                        return Some(cycle);
                    }
                    if stamps[blocker].is_none() {
                        stamps[blocker] = Some(start);
                        on_path[blocker] = true;
                        stack.push(Frame {
                            txn: blocker,
                            next_out: 0,
                            in_edge: Some(edge_ix),
                        });
                    }
                }
                None => {
                    on_path[txn] = false;
                    stack.pop();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::CompNodeId;

    fn obs(txn: GlobalTxnId, conn_id: u32, start_ts: i64, changed: u64, locked: u64) -> BranchObservation {
        BranchObservation {
            txn,
            conn_id,
            start_ts,
            rows_changed: changed,
            rows_locked: locked,
        }
    }

    fn txn_id(n: u32) -> GlobalTxnId {
        GlobalTxnId::new(CompNodeId(1), 100 + n as i64, n)
    }

    #[test]
    fn test_branches_merge_into_one_transaction() {
        let mut graph = WaitGraph::new();
        let a = txn_id(1);
        let b = txn_id(2);
        // A observed on two shards with different branch stats.
        graph.add_observation(
            ShardId(1),
            &DiagRow {
                waiter: obs(a, 11, 105, 3, 5),
                blocker: obs(b, 12, 200, 1, 1),
            },
        );
        graph.add_observation(
            ShardId(2),
            &DiagRow {
                waiter: obs(a, 21, 101, 2, 4),
                blocker: obs(b, 22, 200, 1, 1),
            },
        );
        // Same branch reported twice must not double-count.
        graph.add_observation(
            ShardId(1),
            &DiagRow {
                waiter: obs(a, 11, 105, 3, 5),
                blocker: obs(b, 12, 200, 1, 1),
            },
        );

        assert_eq!(graph.txn_count(), 2);
        let merged = graph.txn(0);
        assert_eq!(merged.id, a);
        assert_eq!(merged.start_ts, 101);
        assert_eq!(merged.rows_changed, 5);
        assert_eq!(merged.rows_locked, 9);
        assert_eq!(graph.branches_of(0).count(), 2);
        assert_eq!(merged.blocked_by, 3);
        assert_eq!(graph.txn(1).blocking, 3);
    }

    #[test]
    fn test_chain_has_no_cycle() {
        let mut graph = WaitGraph::new();
        graph.add_observation(
            ShardId(1),
            &DiagRow {
                waiter: obs(txn_id(1), 11, 100, 0, 0),
                blocker: obs(txn_id(2), 12, 101, 0, 0),
            },
        );
        graph.add_observation(
            ShardId(2),
            &DiagRow {
                waiter: obs(txn_id(2), 21, 101, 0, 0),
                blocker: obs(txn_id(3), 22, 102, 0, 0),
            },
        );
        let mut stamps = vec![None; graph.txn_count()];
        for start in 0..graph.txn_count() {
            assert!(graph.find_cycle_from(start, &mut stamps).is_none());
        }
    }

    #[test]
    fn test_three_node_cycle_is_found_once() {
        let mut graph = WaitGraph::new();
        let (a, b, c) = (txn_id(1), txn_id(2), txn_id(3));
        graph.add_observation(
            ShardId(1),
            &DiagRow {
                waiter: obs(a, 11, 100, 0, 0),
                blocker: obs(b, 12, 101, 0, 0),
            },
        );
        graph.add_observation(
            ShardId(2),
            &DiagRow {
                waiter: obs(b, 21, 101, 0, 0),
                blocker: obs(c, 22, 102, 0, 0),
            },
        );
        graph.add_observation(
            ShardId(1),
            &DiagRow {
                waiter: obs(c, 13, 102, 0, 0),
                blocker: obs(a, 11, 100, 0, 0),
            },
        );

        let mut stamps = vec![None; graph.txn_count()];
        let cycle = graph.find_cycle_from(0, &mut stamps).expect("cycle");
        assert_eq!(cycle.len(), 3);
        assert_eq!(graph.cycle_txns(&cycle).len(), 3);
        assert_eq!(graph.cycle_shards(&cycle).len(), 2);

        // Finished territory is not re-entered by later starts.
        for start in 1..graph.txn_count() {
            assert!(graph.find_cycle_from(start, &mut stamps).is_none());
        }
    }
}
