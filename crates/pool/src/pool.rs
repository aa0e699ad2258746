//! Connection pool proper
//!
//! One connection per (shard, node), owned exclusively by the checking-out
//! flow. A slot remembers valid/reset state across check-outs; an invalid
//! slot reconnects on next use.

use crate::error::{PoolError, Result};
use crate::preamble::{Preamble, SessionVars};
use crate::topology::ShardTopology;
use crate::wire::{ShardConnector, ShardSession};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_common::{ClusterRuntime, NodeId, ShardId};

/// Which node of a shard to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The shard's current master.
    Master,
    /// A specific node.
    Node(NodeId),
}

/// A checked-out connection. Return it with [`ShardPool::release`] or tear
/// it down with [`ShardPool::discard`]; never both.
pub struct PooledConn {
    pub shard: ShardId,
    pub node: NodeId,
    /// Whether the preamble must precede the first statement sent on this
    /// check-out (fresh connection, or reset since last use).
    pub needs_preamble: bool,
    pub session: Box<dyn ShardSession>,
}

impl PooledConn {
    pub fn connection_id(&self) -> u32 {
        self.session.connection_id()
    }
}

impl fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("shard", &self.shard)
            .field("node", &self.node)
            .field("needs_preamble", &self.needs_preamble)
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

struct ConnSlot {
    valid: bool,
    needs_reset: bool,
    /// Parked session; `None` while checked out or after teardown.
    session: Option<Box<dyn ShardSession>>,
}

/// Pool of shard connections for one owning flow (a backend or the
/// deadlock detector). Not shared across flows; `&mut self` throughout.
pub struct ShardPool {
    runtime: Arc<ClusterRuntime>,
    topology: Arc<dyn ShardTopology>,
    connector: Arc<dyn ShardConnector>,
    vars: SessionVars,
    replicated: bool,
    slots: HashMap<(ShardId, NodeId), ConnSlot>,
}

impl ShardPool {
    /// `replicated` enables the primary-role probe in the preamble.
    pub fn new(
        runtime: Arc<ClusterRuntime>,
        topology: Arc<dyn ShardTopology>,
        connector: Arc<dyn ShardConnector>,
        replicated: bool,
    ) -> Self {
        Self {
            runtime,
            topology,
            connector,
            vars: SessionVars::new(),
            replicated,
            slots: HashMap::new(),
        }
    }

    pub fn topology(&self) -> &Arc<dyn ShardTopology> {
        &self.topology
    }

    /// The preamble to bundle ahead of the first statement on a connection
    /// with `needs_preamble` set.
    pub fn preamble(&self) -> Preamble {
        Preamble::build(self.runtime.comp_node(), &self.vars, self.replicated)
    }

    /// Cache a session variable for replay on every fresh/reset connection.
    pub fn set_session_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.set(name, value);
    }

    /// Check out the connection for a shard node, connecting if the slot is
    /// empty or invalid.
    pub async fn acquire(&mut self, shard: ShardId, target: Target) -> Result<PooledConn> {
        let node = match target {
            Target::Master => self.topology.master(shard)?,
            Target::Node(id) => self
                .topology
                .lookup(shard)?
                .into_iter()
                .find(|n| n.node_id == id)
                .ok_or(PoolError::UnknownShard(shard))?,
        };
        let key = (shard, node.node_id);

        if let Some(slot) = self.slots.get_mut(&key) {
            if slot.valid {
                match slot.session.take() {
                    Some(session) => {
                        let needs_preamble = slot.needs_reset;
                        slot.needs_reset = false;
                        return Ok(PooledConn {
                            shard,
                            node: node.node_id,
                            needs_preamble,
                            session,
                        });
                    }
                    None => {
                        return Err(PoolError::Connectivity {
                            shard,
                            reason: "connection already checked out".to_string(),
                        });
                    }
                }
            }
        }

        // Fresh connect; reconnect-on-next-use after invalidation.
        let session = self.connector.connect(shard, &node).await?;
        self.slots.insert(
            key,
            ConnSlot {
                valid: true,
                needs_reset: false,
                session: None,
            },
        );
        tracing::debug!(%shard, node = %node.node_id, "connected to shard node");
        Ok(PooledConn {
            shard,
            node: node.node_id,
            needs_preamble: true,
            session,
        })
    }

    /// Park a healthy connection back into its slot.
    pub fn release(&mut self, conn: PooledConn) {
        if let Some(slot) = self.slots.get_mut(&(conn.shard, conn.node)) {
            slot.valid = true;
            slot.session = Some(conn.session);
        }
    }

    /// Tear a checked-out connection down after a client/protocol-level
    /// failure: the slot is invalidated and a topology re-check scheduled.
    pub fn discard(&mut self, conn: PooledConn) {
        let (shard, node) = (conn.shard, conn.node);
        drop(conn);
        self.invalidate(shard, node);
    }

    /// Invalidate a slot (dropping any parked session) and schedule a
    /// topology re-check for the shard.
    pub fn invalidate(&mut self, shard: ShardId, node: NodeId) {
        if let Some(slot) = self.slots.get_mut(&(shard, node)) {
            slot.valid = false;
            slot.session = None;
        }
        self.runtime.request_topology_check(shard);
        tracing::debug!(%shard, %node, "shard connection invalidated");
    }

    /// Mark a connection as reset: session variables must be resent before
    /// the next transactional statement.
    pub fn mark_reset(&mut self, shard: ShardId, node: NodeId) {
        if let Some(slot) = self.slots.get_mut(&(shard, node)) {
            slot.needs_reset = true;
        }
    }

    /// Hard-disconnect every pooled connection. Used by the abort path when
    /// a connection may be in an undefined transactional state.
    pub fn disconnect_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.valid = false;
            slot.session = None;
        }
    }

    /// Shards with a currently valid slot, for diagnostics.
    pub fn connected_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.valid)
            .map(|((shard, _), _)| *shard)
            .collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }
}
