//! Cluster runtime context
//!
//! The small piece of state shared between user backends and the global
//! deadlock detector: a topology re-check queue and the detector wake-up
//! signal. Every critical section is O(1); no lock is ever held across a
//! network round trip. An `Arc<ClusterRuntime>` is injected into every
//! component constructor instead of living in process-wide globals.

use crate::{CompNodeId, ShardId};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct TopoChecks {
    queue: VecDeque<ShardId>,
    queued: HashSet<ShardId>,
}

/// Shared runtime state for one compute node.
pub struct ClusterRuntime {
    comp_node: CompNodeId,
    topo: Mutex<TopoChecks>,
    wake_requests: AtomicU64,
    wake: Notify,
    last_pass_ts: AtomicI64,
}

impl ClusterRuntime {
    pub fn new(comp_node: CompNodeId) -> Self {
        Self {
            comp_node,
            topo: Mutex::new(TopoChecks::default()),
            wake_requests: AtomicU64::new(0),
            wake: Notify::new(),
            last_pass_ts: AtomicI64::new(0),
        }
    }

    /// The compute node this runtime belongs to.
    pub fn comp_node(&self) -> CompNodeId {
        self.comp_node
    }

    /// Schedule a topology re-check for a shard whose master may have moved.
    /// Duplicate requests for a shard already queued are coalesced.
    pub fn request_topology_check(&self, shard: ShardId) {
        let mut topo = self.topo.lock();
        if topo.queued.insert(shard) {
            topo.queue.push_back(shard);
        }
    }

    /// Drain all pending topology re-check requests.
    pub fn drain_topology_checks(&self) -> Vec<ShardId> {
        let mut topo = self.topo.lock();
        topo.queued.clear();
        topo.queue.drain(..).collect()
    }

    /// Number of topology re-checks currently queued.
    pub fn pending_topology_checks(&self) -> usize {
        self.topo.lock().queue.len()
    }

    /// Ask the deadlock detector to run a round ahead of schedule. Raised by
    /// backends that have been waiting too long for a DML result.
    pub fn wake_detector(&self) -> u64 {
        let n = self.wake_requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.wake.notify_one();
        n
    }

    /// Await the next on-demand wake-up request. Used only by the detector.
    pub async fn detector_wakeup(&self) {
        self.wake.notified().await;
    }

    /// Take and reset the wake-request counter at the start of a pass.
    pub fn take_wake_requests(&self) -> u64 {
        self.wake_requests.swap(0, Ordering::Relaxed)
    }

    /// Record that a detection pass ran at `unix_ts`.
    pub fn note_detector_pass(&self, unix_ts: i64) {
        self.last_pass_ts.store(unix_ts, Ordering::Relaxed);
    }

    /// Unix timestamp of the last detection pass, 0 if none yet.
    pub fn last_detector_pass(&self) -> i64 {
        self.last_pass_ts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_checks_coalesce() {
        let rt = ClusterRuntime::new(CompNodeId(1));
        rt.request_topology_check(ShardId(1));
        rt.request_topology_check(ShardId(2));
        rt.request_topology_check(ShardId(1));
        assert_eq!(rt.pending_topology_checks(), 2);
        assert_eq!(rt.drain_topology_checks(), vec![ShardId(1), ShardId(2)]);
        assert_eq!(rt.pending_topology_checks(), 0);
        // Drained shards can be queued again.
        rt.request_topology_check(ShardId(1));
        assert_eq!(rt.pending_topology_checks(), 1);
    }

    #[test]
    fn test_wake_requests_counted_and_reset() {
        let rt = ClusterRuntime::new(CompNodeId(1));
        assert_eq!(rt.wake_detector(), 1);
        assert_eq!(rt.wake_detector(), 2);
        assert_eq!(rt.take_wake_requests(), 2);
        assert_eq!(rt.take_wake_requests(), 0);
    }

    #[tokio::test]
    async fn test_detector_wakeup_notified() {
        let rt = std::sync::Arc::new(ClusterRuntime::new(CompNodeId(1)));
        let rt2 = rt.clone();
        let waiter = tokio::spawn(async move { rt2.detector_wakeup().await });
        tokio::task::yield_now().await;
        rt.wake_detector();
        waiter.await.unwrap();
    }
}
