//! Sharded, replicated CRDT instances.
//!
//! A managed instance owns a fixed number of shards. Each key hashes to one
//! shard; the shard's write replicas apply operations locally and propagate
//! the resulting deltas, every other node forwards the operation to one of
//! them. Reads are always served from the local copy.

use crate::context::{NodeContext, OperationContext};
use crate::distribution::ReplicaDistributor;
use crate::error::{ClusterError, Result};
use crate::exchange::{ShardEndpoint, SyncEndpoint};
use crate::ids::{InstanceId, ReplicaId, ShardId};
use crate::metadata::InstanceDescriptor;
use crate::propagation::PropagationService;
use crate::provider::ManagedInstance;
use crate::rerouting::ReroutingService;
use crate::shard::Shard;
use async_trait::async_trait;
use sdx_core::delta::{MergeResult, Operable};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

/// Node-wide services a managed instance needs to replicate.
pub struct ReplicationServices {
    pub node: Arc<NodeContext>,
    pub distributor: Arc<ReplicaDistributor>,
    pub propagation: Arc<PropagationService>,
    pub rerouting: Arc<ReroutingService>,
}

pub struct ManagedCrdt<C> {
    id: InstanceId,
    crdt_type: String,
    replica_count: u32,
    shards: Vec<Arc<Shard<C>>>,
    services: Arc<ReplicationServices>,
}

impl<C: Operable> ManagedCrdt<C> {
    pub fn new(descriptor: &InstanceDescriptor, services: Arc<ReplicationServices>) -> Self {
        let shard_count = descriptor.shard_count.max(1);
        Self {
            id: descriptor.instance.clone(),
            crdt_type: descriptor.crdt_type.clone(),
            replica_count: descriptor.replica_count,
            shards: (0..shard_count).map(|id| Arc::new(Shard::new(id))).collect(),
            services,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn replica(&self, shard: ShardId) -> ReplicaId {
        ReplicaId::new(self.id.clone(), shard)
    }

    /// Shard owning `key`: SHA-256 of the key's encoded form, first eight
    /// bytes big-endian, modulo the shard count.
    pub fn shard_for(&self, key: &C::Key) -> Result<ShardId> {
        let bytes = self.services.node.serializer.encode(key)?;
        let digest = Sha256::digest(&bytes);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let shard = u64::from_be_bytes(prefix) % self.shards.len() as u64;
        Ok(shard as ShardId)
    }

    pub fn shard(&self, shard: ShardId) -> Result<&Arc<Shard<C>>> {
        self.shards.get(usize::from(shard)).ok_or_else(|| {
            ClusterError::ProtocolViolation(format!("{} has no shard {}", self.id, shard))
        })
    }

    /// Apply an operation entering the cluster at this node.
    pub async fn execute(&self, op: C::Operation) -> Result<C::Output> {
        self.apply(op, self.services.node.operation()).await
    }

    /// Apply locally when this node is a write replica of the key's shard,
    /// otherwise forward the operation to one.
    pub async fn apply(&self, op: C::Operation, ctx: OperationContext) -> Result<C::Output> {
        ctx.ensure_active()?;
        let shard_id = self.shard_for(C::operation_key(&op))?;
        let replica = self.replica(shard_id);
        let node = &self.services.node;

        if !self.services.distributor.is_write_replica(&replica, node.id()) {
            let encoded = node.serializer.encode(&op)?;
            let output = self.services.rerouting.reroute(&replica, encoded, &ctx).await?;
            return node.serializer.decode(&output);
        }

        let (output, deltas) = self.shard(shard_id)?.apply(node.actor(), op);
        if deltas.is_empty() {
            return Ok(output);
        }
        debug!(%replica, deltas = deltas.len(), trace_id = %ctx.trace_id, "applied locally");

        let encoded = node.serializer.encode(&deltas)?;
        if node.config.await_propagation {
            if let Err(e) = self.services.propagation.propagate(&replica, encoded, &ctx).await {
                warn!(%replica, error = %e, "propagation incomplete, anti-entropy will repair");
            }
        } else {
            let propagation = self.services.propagation.clone();
            let ctx = ctx.detached();
            tokio::spawn(async move {
                if let Err(e) = propagation.propagate(&replica, encoded, &ctx).await {
                    warn!(%replica, error = %e, "propagation incomplete, anti-entropy will repair");
                }
            });
        }
        Ok(output)
    }

    /// Read the local copy of the shard owning `key`.
    pub fn read<R>(&self, key: &C::Key, f: impl FnOnce(&C) -> R) -> Result<R> {
        let shard = self.shard_for(key)?;
        Ok(self.shard(shard)?.read(f))
    }

    /// Read every local shard.
    pub fn read_all<R>(&self, mut f: impl FnMut(&C) -> R) -> Vec<R> {
        self.shards.iter().map(|shard| shard.read(&mut f)).collect()
    }

    pub fn timestamp(&self, shard: ShardId) -> Result<C::Timestamp> {
        Ok(self.shard(shard)?.timestamp())
    }
}

#[async_trait]
impl<C: Operable> ManagedInstance for ManagedCrdt<C> {
    fn instance_id(&self) -> &InstanceId {
        &self.id
    }

    fn crdt_type(&self) -> &str {
        &self.crdt_type
    }

    fn shard_count(&self) -> u16 {
        self.shards.len() as u16
    }

    fn replica_count(&self) -> u32 {
        self.replica_count
    }

    fn endpoint(&self, shard: ShardId) -> Result<Arc<dyn SyncEndpoint>> {
        let shard = self.shard(shard)?.clone();
        Ok(Arc::new(ShardEndpoint::new(shard, self.services.node.serializer)))
    }

    fn merge_bytes(&self, shard: ShardId, deltas: &[u8]) -> Result<MergeResult> {
        self.endpoint(shard)?.merge_bytes(deltas)
    }

    async fn apply_serialized(&self, shard: ShardId, operation: &[u8], ctx: OperationContext) -> Result<Vec<u8>> {
        let serializer = self.services.node.serializer;
        let op: C::Operation = serializer.decode(operation)?;
        let expected = self.shard_for(C::operation_key(&op))?;
        if expected != shard {
            return Err(ClusterError::ProtocolViolation(format!(
                "operation for {} shard {} arrived for shard {}",
                self.id, expected, shard
            )));
        }
        let output = self.apply(op, ctx).await?;
        serializer.encode(&output)
    }

    fn shard_sizes(&self) -> Vec<(ShardId, u64)> {
        self.shards.iter().map(|s| (s.id(), s.size())).collect()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<C> std::fmt::Debug for ManagedCrdt<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCrdt")
            .field("id", &self.id)
            .field("crdt_type", &self.crdt_type)
            .field("shards", &self.shards.len())
            .field("replica_count", &self.replica_count)
            .finish()
    }
}
