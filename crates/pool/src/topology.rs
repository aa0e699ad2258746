//! Shard topology seam
//!
//! Topology and credential caching is an external collaborator; the pool
//! only needs lookups. `StaticTopology` covers tests and fixed deployments.

use crate::error::{PoolError, Result};
use std::collections::BTreeMap;
use tessera_common::{NodeId, ShardId};

/// One reachable node (replica) of a shard.
#[derive(Debug, Clone)]
pub struct ShardNode {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Lookup interface consumed from the topology service.
pub trait ShardTopology: Send + Sync {
    /// All known nodes of a shard, master first.
    fn lookup(&self, shard: ShardId) -> Result<Vec<ShardNode>>;

    /// The node currently believed to be the shard's master.
    fn master(&self, shard: ShardId) -> Result<ShardNode> {
        self.lookup(shard)?
            .into_iter()
            .next()
            .ok_or(PoolError::UnknownShard(shard))
    }

    /// Every shard in the cluster, in stable order.
    fn all_shards(&self) -> Vec<ShardId>;
}

/// Fixed topology built up-front; master is the first node of each entry.
#[derive(Debug, Default)]
pub struct StaticTopology {
    shards: BTreeMap<ShardId, Vec<ShardNode>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_shard(&mut self, shard: ShardId, nodes: Vec<ShardNode>) {
        self.shards.insert(shard, nodes);
    }
}

impl ShardTopology for StaticTopology {
    fn lookup(&self, shard: ShardId) -> Result<Vec<ShardNode>> {
        self.shards
            .get(&shard)
            .cloned()
            .ok_or(PoolError::UnknownShard(shard))
    }

    fn all_shards(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }
}
