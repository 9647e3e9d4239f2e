//! Server-side dispatch of the node-to-node protocol.

use crate::config::NodeConfig;
use crate::context::{NodeContext, OperationContext};
use crate::distribution::{ClusterView, Holders};
use crate::error::{ClusterError, Result};
use crate::exchange::SyncEndpoint;
use crate::ids::{InstanceId, NodeInfo, ReplicaId, ReplicaInfo};
use crate::managed::ReplicationServices;
use crate::metadata::{ClusterMetadata, MetadataKind, ReplicaHolding};
use crate::provider::{CrdtTypeRegistry, ManagedCrdtProvider, ManagedInstance};
use sdx_core::delta::MergeResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a node serves to its peers.
pub struct NodeService {
    node: Arc<NodeContext>,
    metadata: Arc<ClusterMetadata>,
    provider: Arc<ManagedCrdtProvider>,
    registry: CrdtTypeRegistry,
    services: Arc<ReplicationServices>,
    cancellation: CancellationToken,
}

impl NodeService {
    pub fn new(
        services: Arc<ReplicationServices>,
        metadata: Arc<ClusterMetadata>,
        registry: CrdtTypeRegistry,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            node: services.node.clone(),
            metadata,
            provider: Arc::new(ManagedCrdtProvider::new()),
            registry,
            services,
            cancellation,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.node.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.node.config
    }

    pub fn metadata(&self) -> &Arc<ClusterMetadata> {
        &self.metadata
    }

    pub fn provider(&self) -> &Arc<ManagedCrdtProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &CrdtTypeRegistry {
        &self.registry
    }

    pub fn services(&self) -> &Arc<ReplicationServices> {
        &self.services
    }

    /// Child token for work started on behalf of a peer.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    /// Look up a hosted instance, refreshing from metadata once if unknown.
    pub fn instance(&self, id: &InstanceId) -> Result<Arc<dyn ManagedInstance>> {
        if let Some(instance) = self.provider.get(id) {
            return Ok(instance);
        }
        self.refresh_topology();
        self.provider
            .get(id)
            .ok_or_else(|| ClusterError::InstanceNotFound(id.clone()))
    }

    pub async fn handle_merge(&self, replica: &ReplicaId, deltas: &[u8], ctx: OperationContext) -> Result<MergeResult> {
        let instance = self.instance(&replica.instance)?;
        let result = instance.merge_bytes(replica.shard, deltas)?;
        debug!(
            %replica,
            updated = result.is_updated(),
            budget = ctx.budget(),
            trace_id = %ctx.trace_id,
            "merge received"
        );

        if result.is_updated() && ctx.budget() > 0 {
            if let Err(e) = self
                .services
                .propagation
                .propagate(replica, deltas.to_vec(), &ctx)
                .await
            {
                warn!(%replica, error = %e, "forwarding merged deltas failed");
            }
        }
        Ok(result)
    }

    pub async fn handle_merge_metadata(
        &self,
        kind: MetadataKind,
        deltas: &[u8],
        ctx: OperationContext,
    ) -> Result<MergeResult> {
        let result = self.metadata.merge_bytes(kind, deltas)?;
        if result.is_updated() {
            self.refresh_topology();
            if ctx.budget() > 0 {
                if let Err(e) = self
                    .services
                    .propagation
                    .propagate_metadata(kind, deltas.to_vec(), &ctx)
                    .await
                {
                    warn!(%kind, error = %e, "forwarding metadata failed");
                }
            }
        }
        Ok(result)
    }

    pub async fn handle_reroute(&self, replica: &ReplicaId, operation: &[u8], ctx: OperationContext) -> Result<Vec<u8>> {
        let instance = self.instance(&replica.instance)?;
        instance.apply_serialized(replica.shard, operation, ctx).await
    }

    pub fn endpoint(&self, replica: &ReplicaId) -> Result<Arc<dyn SyncEndpoint>> {
        self.instance(&replica.instance)?.endpoint(replica.shard)
    }

    pub fn metadata_endpoint(&self, kind: MetadataKind) -> Arc<dyn SyncEndpoint> {
        self.metadata.endpoint(kind)
    }

    /// Admit `joiner` and hand back a snapshot of every metadata kind.
    pub async fn handle_join(&self, joiner: NodeInfo, ctx: OperationContext) -> Result<Vec<(MetadataKind, Vec<u8>)>> {
        info!(joiner = %joiner.id, address = %joiner.address, "join request");
        if let Some(deltas) = self.metadata.add_member(&joiner)? {
            self.refresh_topology();
            if let Err(e) = self
                .services
                .propagation
                .propagate_metadata(MetadataKind::Membership, deltas, &ctx)
                .await
            {
                warn!(joiner = %joiner.id, error = %e, "announcing new member failed");
            }
        }

        MetadataKind::ALL
            .into_iter()
            .map(|kind| Ok((kind, self.metadata.snapshot(kind)?)))
            .collect()
    }

    /// Instantiate newly described instances and feed the distributor.
    ///
    /// Returns `true` when the placement plan changed.
    pub fn refresh_topology(&self) -> bool {
        let descriptors = self.metadata.instances();
        for descriptor in &descriptors {
            if self.provider.contains(&descriptor.instance) {
                continue;
            }
            match self.registry.instantiate(descriptor, &self.services) {
                Ok(instance) => {
                    self.provider.insert(instance);
                }
                Err(e) => warn!(instance = %descriptor.instance, error = %e, "cannot host instance"),
            }
        }

        let members = self.metadata.members();
        let mut sizes: BTreeMap<ReplicaId, u64> = BTreeMap::new();
        let mut holders = Holders::new();
        for (holding, size) in self.metadata.sizes() {
            if size == 0 || !members.iter().any(|m| m.id == holding.node) {
                continue;
            }
            let largest = sizes.entry(holding.replica.clone()).or_default();
            *largest = (*largest).max(size);
            holders.entry(holding.replica).or_default().insert(holding.node);
        }

        let sizes = &sizes;
        let replicas = descriptors
            .iter()
            .flat_map(|descriptor| {
                descriptor.replicas().map(move |replica| ReplicaInfo {
                    size: sizes.get(&replica).copied().unwrap_or(0),
                    requested_replicas: descriptor.replica_count,
                    replica,
                })
            })
            .collect();

        self.services.distributor.update(ClusterView {
            nodes: members,
            replicas,
            holders,
        })
    }

    /// Record local shard sizes in metadata and push any change.
    pub async fn publish_sizes(&self) -> Result<()> {
        let local = self.node.id();
        let mut reports = Vec::new();
        for instance in self.provider.all() {
            for (shard, size) in instance.shard_sizes() {
                let replica = ReplicaId::new(instance.instance_id().clone(), shard);
                if size > 0 || self.services.distributor.is_read_replica(&replica, local) {
                    let holding = ReplicaHolding {
                        replica,
                        node: local.clone(),
                    };
                    reports.push((holding, size));
                }
            }
        }

        if let Some(deltas) = self.metadata.record_sizes(reports)? {
            self.refresh_topology();
            if let Err(e) = self
                .services
                .propagation
                .propagate_metadata(MetadataKind::ReplicaSizes, deltas, &self.node.operation())
                .await
            {
                debug!(error = %e, "size report not pushed everywhere");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("node", &self.node.local)
            .field("instances", &self.provider.len())
            .finish()
    }
}
