//! Cluster metadata, itself replicated as CRDTs.
//!
//! Membership is an OR-Set of nodes; instance descriptors and per-node
//! replica sizes are LWW registries. Every node holds a full copy and
//! exchanges it with the same delta machinery as user data.

use crate::error::Result;
use crate::exchange::{ShardEndpoint, SyncEndpoint};
use crate::ids::{InstanceId, NodeId, NodeInfo, ReplicaId};
use crate::serializer::Serializer;
use crate::shard::Shard;
use sdx_core::delta::{DeltaCrdt, MergeResult};
use sdx_core::lwwreg::LwwRegistry;
use sdx_core::orset::OrSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// The three metadata CRDTs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Membership,
    Instances,
    ReplicaSizes,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 3] = [
        MetadataKind::Membership,
        MetadataKind::Instances,
        MetadataKind::ReplicaSizes,
    ];
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataKind::Membership => "membership",
            MetadataKind::Instances => "instances",
            MetadataKind::ReplicaSizes => "replica_sizes",
        };
        f.write_str(name)
    }
}

/// What every node needs to know to host an instance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance: InstanceId,
    /// Registered type name, resolved through the type registry
    pub crdt_type: String,
    pub shard_count: u16,
    pub replica_count: u32,
}

impl InstanceDescriptor {
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.shard_count).map(move |shard| ReplicaId::new(self.instance.clone(), shard))
    }
}

/// Key of a size report: one node's copy of one replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaHolding {
    pub replica: ReplicaId,
    pub node: NodeId,
}

pub type Membership = OrSet<NodeInfo>;
pub type InstanceTable = LwwRegistry<InstanceId, InstanceDescriptor>;
pub type SizeTable = LwwRegistry<ReplicaHolding, u64>;

pub struct ClusterMetadata {
    actor: String,
    serializer: Serializer,
    membership: Arc<Shard<Membership>>,
    instances: Arc<Shard<InstanceTable>>,
    sizes: Arc<Shard<SizeTable>>,
}

impl ClusterMetadata {
    pub fn new(local: &NodeId, serializer: Serializer) -> Self {
        Self {
            actor: local.as_str().to_string(),
            serializer,
            membership: Arc::new(Shard::new(0)),
            instances: Arc::new(Shard::new(0)),
            sizes: Arc::new(Shard::new(0)),
        }
    }

    /// Add a member unless already present. Returns encoded deltas to push.
    pub fn add_member(&self, node: &NodeInfo) -> Result<Option<Vec<u8>>> {
        let delta = self.membership.mutate(|set| {
            if set.contains(node) {
                None
            } else {
                Some(set.add(&self.actor, node.clone()))
            }
        });
        match delta {
            Some(delta) => {
                info!(node = %node.id, address = %node.address, "member added");
                Ok(Some(self.serializer.encode(&[delta])?))
            }
            None => Ok(None),
        }
    }

    /// Record an instance descriptor unless an identical one is registered.
    pub fn register_instance(&self, descriptor: &InstanceDescriptor) -> Result<Option<Vec<u8>>> {
        let delta = self.instances.mutate(|table| {
            if table.get(&descriptor.instance) == Some(descriptor) {
                return None;
            }
            let time = next_time(table.stamp(&descriptor.instance).map(|s| s.time));
            table
                .try_set(&self.actor, descriptor.instance.clone(), descriptor.clone(), time)
                .ok()
        });
        match delta {
            Some(delta) => {
                info!(instance = %descriptor.instance, crdt_type = %descriptor.crdt_type, "instance registered");
                Ok(Some(self.serializer.encode(&[delta])?))
            }
            None => Ok(None),
        }
    }

    /// Record size reports that differ from what is stored.
    pub fn record_sizes<I>(&self, reports: I) -> Result<Option<Vec<u8>>>
    where
        I: IntoIterator<Item = (ReplicaHolding, u64)>,
    {
        let deltas: Vec<_> = self.sizes.mutate(|table| {
            reports
                .into_iter()
                .filter_map(|(holding, size)| {
                    if table.get(&holding) == Some(&size) {
                        return None;
                    }
                    let time = next_time(table.stamp(&holding).map(|s| s.time));
                    table.try_set(&self.actor, holding, size, time).ok()
                })
                .collect()
        });
        if deltas.is_empty() {
            return Ok(None);
        }
        debug!(reports = deltas.len(), "replica sizes recorded");
        Ok(Some(self.serializer.encode(&deltas)?))
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        self.membership.read(|set| set.iter().cloned().collect())
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.membership.read(|set| set.iter().any(|n| &n.id == id))
    }

    pub fn instances(&self) -> Vec<InstanceDescriptor> {
        self.instances.read(|table| table.iter().map(|(_, d)| d.clone()).collect())
    }

    pub fn instance(&self, id: &InstanceId) -> Option<InstanceDescriptor> {
        self.instances.read(|table| table.get(id).cloned())
    }

    pub fn sizes(&self) -> Vec<(ReplicaHolding, u64)> {
        self.sizes
            .read(|table| table.iter().map(|(h, s)| (h.clone(), *s)).collect())
    }

    pub fn endpoint(&self, kind: MetadataKind) -> Arc<dyn SyncEndpoint> {
        match kind {
            MetadataKind::Membership => Arc::new(ShardEndpoint::new(self.membership.clone(), self.serializer)),
            MetadataKind::Instances => Arc::new(ShardEndpoint::new(self.instances.clone(), self.serializer)),
            MetadataKind::ReplicaSizes => Arc::new(ShardEndpoint::new(self.sizes.clone(), self.serializer)),
        }
    }

    pub fn merge_bytes(&self, kind: MetadataKind, batch: &[u8]) -> Result<MergeResult> {
        let result = self.endpoint(kind).merge_bytes(batch)?;
        if result.is_updated() {
            debug!(%kind, "metadata updated");
        }
        Ok(result)
    }

    /// The full history of one metadata CRDT, encoded as a single batch.
    pub fn snapshot(&self, kind: MetadataKind) -> Result<Vec<u8>> {
        match kind {
            MetadataKind::Membership => self.encode_all(&self.membership),
            MetadataKind::Instances => self.encode_all(&self.instances),
            MetadataKind::ReplicaSizes => self.encode_all(&self.sizes),
        }
    }

    fn encode_all<C: DeltaCrdt>(&self, shard: &Shard<C>) -> Result<Vec<u8>> {
        let deltas: Vec<C::Delta> = shard.read(|crdt| crdt.deltas_since(None).collect());
        self.serializer.encode(&deltas)
    }
}

impl fmt::Debug for ClusterMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterMetadata")
            .field("actor", &self.actor)
            .field("members", &self.membership.read(|s| s.len()))
            .field("instances", &self.instances.read(|t| t.len()))
            .finish()
    }
}

/// Wall-clock millis, bumped past `previous` so a local rewrite always wins.
fn next_time(previous: Option<u64>) -> u64 {
    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    match previous {
        Some(previous) if previous >= now => previous + 1,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(id: &str) -> ClusterMetadata {
        ClusterMetadata::new(&NodeId::new(id), Serializer)
    }

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::new(id), format!("mem://{}", id))
    }

    fn descriptor(name: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            instance: InstanceId::new(name),
            crdt_type: "orset<string>".into(),
            shard_count: 2,
            replica_count: 2,
        }
    }

    #[test]
    fn test_membership_changes_emit_once() {
        let meta = metadata("a");
        assert!(meta.add_member(&node("a")).unwrap().is_some());
        assert!(meta.add_member(&node("a")).unwrap().is_none());
        assert!(meta.is_member(&NodeId::new("a")));
    }

    #[test]
    fn test_pushed_deltas_apply_on_peer() {
        let a = metadata("a");
        let b = metadata("b");

        let bytes = a.register_instance(&descriptor("carts")).unwrap().unwrap();
        assert!(b.merge_bytes(MetadataKind::Instances, &bytes).unwrap().is_updated());
        assert!(!b.merge_bytes(MetadataKind::Instances, &bytes).unwrap().is_updated());
        assert_eq!(b.instance(&InstanceId::new("carts")), Some(descriptor("carts")));
        assert_eq!(descriptor("carts").replicas().count(), 2);
    }

    #[test]
    fn test_unchanged_sizes_are_not_rerecorded() {
        let meta = metadata("a");
        let holding = ReplicaHolding {
            replica: ReplicaId::new(InstanceId::new("carts"), 0),
            node: NodeId::new("a"),
        };

        assert!(meta.record_sizes([(holding.clone(), 10)]).unwrap().is_some());
        assert!(meta.record_sizes([(holding.clone(), 10)]).unwrap().is_none());
        assert!(meta.record_sizes([(holding.clone(), 12)]).unwrap().is_some());
        assert_eq!(meta.sizes(), vec![(holding, 12)]);
    }

    #[test]
    fn test_snapshot_restores_everything() {
        let a = metadata("a");
        a.add_member(&node("a")).unwrap();
        a.add_member(&node("b")).unwrap();
        a.register_instance(&descriptor("carts")).unwrap();

        let c = metadata("c");
        for kind in MetadataKind::ALL {
            c.merge_bytes(kind, &a.snapshot(kind).unwrap()).unwrap();
        }
        assert_eq!(c.members(), a.members());
        assert_eq!(c.instances(), a.instances());
    }
}
