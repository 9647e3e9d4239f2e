//! A cluster node: wiring, lifecycle and joining.

use crate::anti_entropy::{AntiEntropyService, SyncSummary};
use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::discovery::DiscoveryStrategy;
use crate::distribution::{DistributionStrategy, ReplicaDistributor, RingDistribution};
use crate::error::{ClusterError, Result};
use crate::failure::FailureDetector;
use crate::ids::{InstanceId, NodeId, NodeInfo, ReplicaId};
use crate::managed::{ManagedCrdt, ReplicationServices};
use crate::metadata::{ClusterMetadata, InstanceDescriptor, MetadataKind};
use crate::network::NodeClientProvider;
use crate::node_service::NodeService;
use crate::propagation::PropagationService;
use crate::provider::CrdtTypeRegistry;
use crate::rerouting::ReroutingService;
use crate::selection::{AllNodes, NodeSelectionStrategy, RingSuccessor};
use crate::snapshot::SnapshotStore;
use futures::StreamExt;
use parking_lot::Mutex;
use sdx_core::delta::Operable;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Placement and peer-selection policies of a node.
///
/// Every node of a cluster must use the same distribution strategy, since
/// placement is computed locally. Selection strategies may differ per node.
pub struct NodeStrategies {
    pub distribution: Box<dyn DistributionStrategy>,
    /// Which write replicas receive a push
    pub propagation: Box<dyn NodeSelectionStrategy>,
    /// Which write replica a forwarded operation goes to; only the first pick is used
    pub rerouting: Box<dyn NodeSelectionStrategy>,
    /// Which peer each anti-entropy exchange runs against
    pub anti_entropy: Box<dyn NodeSelectionStrategy>,
}

impl NodeStrategies {
    pub fn distribution(mut self, strategy: impl DistributionStrategy + 'static) -> Self {
        self.distribution = Box::new(strategy);
        self
    }

    pub fn propagation(mut self, strategy: impl NodeSelectionStrategy + 'static) -> Self {
        self.propagation = Box::new(strategy);
        self
    }

    pub fn rerouting(mut self, strategy: impl NodeSelectionStrategy + 'static) -> Self {
        self.rerouting = Box::new(strategy);
        self
    }

    pub fn anti_entropy(mut self, strategy: impl NodeSelectionStrategy + 'static) -> Self {
        self.anti_entropy = Box::new(strategy);
        self
    }
}

impl Default for NodeStrategies {
    /// Ring placement, push to every write replica, ring successor otherwise.
    fn default() -> Self {
        Self {
            distribution: Box::new(RingDistribution),
            propagation: Box::new(AllNodes),
            rerouting: Box::new(RingSuccessor),
            anti_entropy: Box::new(RingSuccessor),
        }
    }
}

impl std::fmt::Debug for NodeStrategies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStrategies").finish_non_exhaustive()
    }
}

pub struct ClusterNode {
    node: Arc<NodeContext>,
    service: Arc<NodeService>,
    anti_entropy: Arc<AntiEntropyService>,
    clients: Arc<dyn NodeClientProvider>,
    failures: Arc<FailureDetector>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Build a node with the default strategies.
    pub fn new(
        config: NodeConfig,
        clients: Arc<dyn NodeClientProvider>,
        registry: CrdtTypeRegistry,
    ) -> Result<Self> {
        Self::with_strategies(config, clients, registry, NodeStrategies::default())
    }

    /// Build a node and add it to its own membership view. A checkpoint at
    /// the configured snapshot path is restored.
    pub fn with_strategies(
        config: NodeConfig,
        clients: Arc<dyn NodeClientProvider>,
        registry: CrdtTypeRegistry,
        strategies: NodeStrategies,
    ) -> Result<Self> {
        let node = Arc::new(NodeContext::new(config)?);
        let failures = Arc::new(FailureDetector::new(node.config.unreachable_recheck()));
        let distributor = Arc::new(ReplicaDistributor::new(
            strategies.distribution,
            node.config.size_change_threshold,
        ));
        let propagation = Arc::new(PropagationService::new(
            node.clone(),
            distributor.clone(),
            clients.clone(),
            failures.clone(),
            strategies.propagation,
        ));
        let rerouting = Arc::new(ReroutingService::new(
            node.clone(),
            distributor.clone(),
            clients.clone(),
            failures.clone(),
            strategies.rerouting,
        ));
        let services = Arc::new(ReplicationServices {
            node: node.clone(),
            distributor,
            propagation,
            rerouting,
        });

        let metadata = Arc::new(ClusterMetadata::new(node.id(), node.serializer));
        metadata.add_member(&node.local)?;

        let cancel = CancellationToken::new();
        let service = Arc::new(NodeService::new(
            services,
            metadata,
            registry,
            cancel.child_token(),
        ));
        service.refresh_topology();

        let mut anti_entropy = AntiEntropyService::new(
            service.clone(),
            clients.clone(),
            failures.clone(),
            strategies.anti_entropy,
        );
        if let Some(path) = &node.config.snapshot_path {
            let store = SnapshotStore::new(path.clone(), node.serializer);
            match store.load() {
                Ok(Some(checkpoint)) => anti_entropy.restore(checkpoint),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable checkpoint ignored"),
            }
            anti_entropy = anti_entropy.with_snapshots(store);
        }
        let anti_entropy = Arc::new(anti_entropy);

        info!(node = %node.local.id, address = %node.local.address, "node created");
        Ok(Self {
            node,
            service,
            anti_entropy,
            clients,
            failures,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn info(&self) -> &NodeInfo {
        &self.node.local
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.node
    }

    /// The server side, to be registered with a transport.
    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    pub fn metadata(&self) -> &Arc<ClusterMetadata> {
        self.service.metadata()
    }

    pub fn distributor(&self) -> &Arc<ReplicaDistributor> {
        &self.service.services().distributor
    }

    pub fn propagation(&self) -> &Arc<PropagationService> {
        &self.service.services().propagation
    }

    pub fn failures(&self) -> &Arc<FailureDetector> {
        &self.failures
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        self.metadata().members()
    }

    /// Create an instance with the configured shard and replica counts.
    pub async fn create_instance<C: Operable>(&self, id: impl Into<String>) -> Result<Arc<ManagedCrdt<C>>> {
        let config = &self.node.config;
        self.create_instance_with(id, config.default_shard_count, config.default_replica_count)
            .await
    }

    /// Create an instance, or return the existing one of the same type.
    pub async fn create_instance_with<C: Operable>(
        &self,
        id: impl Into<String>,
        shard_count: u16,
        replica_count: u32,
    ) -> Result<Arc<ManagedCrdt<C>>> {
        let id = InstanceId::new(id);
        let crdt_type = self.service.registry().name_of::<C>()?.to_string();

        if let Some(existing) = self.metadata().instance(&id) {
            if existing.crdt_type != crdt_type {
                return Err(ClusterError::UnknownCrdtType(format!(
                    "{} already exists as {}",
                    id, existing.crdt_type
                )));
            }
            return self.instance::<C>(&id);
        }

        let descriptor = InstanceDescriptor {
            instance: id.clone(),
            crdt_type,
            shard_count: shard_count.max(1),
            replica_count: replica_count.max(1),
        };
        if let Some(deltas) = self.metadata().register_instance(&descriptor)? {
            self.service.refresh_topology();
            if let Err(e) = self
                .propagation()
                .propagate_metadata(MetadataKind::Instances, deltas, &self.node.operation())
                .await
            {
                warn!(instance = %id, error = %e, "instance announcement incomplete");
            }
        }
        self.instance::<C>(&id)
    }

    /// A hosted instance with its concrete type.
    pub fn instance<C: Operable>(&self, id: &InstanceId) -> Result<Arc<ManagedCrdt<C>>> {
        self.service
            .instance(id)?
            .as_any()
            .downcast::<ManagedCrdt<C>>()
            .map_err(|_| {
                ClusterError::UnknownCrdtType(format!("{} is not a {}", id, std::any::type_name::<C>()))
            })
    }

    /// Contact every discovered candidate and merge the metadata it returns.
    ///
    /// Returns the number of candidates that answered.
    pub async fn join(&self, discovery: &dyn DiscoveryStrategy) -> Result<usize> {
        let mut joined = 0;
        let mut candidates = discovery.discover();
        while let Some(candidate) = candidates.next().await {
            if candidate.address == self.node.local.address {
                continue;
            }
            match self.join_via(&candidate.address).await {
                Ok(()) => {
                    info!(via = %candidate.display_name, "joined cluster");
                    joined += 1;
                }
                Err(e) => warn!(via = %candidate.display_name, error = %e, "join attempt failed"),
            }
        }
        self.service.refresh_topology();
        Ok(joined)
    }

    async fn join_via(&self, address: &str) -> Result<()> {
        let client = self.clients.client_for_address(address)?;
        let mut snapshots = client
            .join_cluster(self.node.local.clone(), self.node.operation())
            .await?;
        while let Some(item) = snapshots.next().await {
            let (kind, deltas) = item?;
            self.metadata().merge_bytes(kind, &deltas)?;
        }
        Ok(())
    }

    /// Run one anti-entropy round now.
    pub async fn sync_once(&self) -> Result<SyncSummary> {
        self.anti_entropy.sync_round(&self.cancel).await
    }

    /// Write a sync checkpoint now. Returns `false` when snapshots are off.
    pub async fn save_snapshot(&self) -> Result<bool> {
        self.anti_entropy.save_snapshot().await
    }

    /// Replicas still catching up with a restored checkpoint.
    pub fn pending_resume(&self) -> Vec<ReplicaId> {
        self.anti_entropy.pending_resume()
    }

    /// Start periodic anti-entropy, checkpoints and retry replay on recovery.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.anti_entropy.clone().spawn(self.cancel.child_token()));
        tasks.extend(
            self.anti_entropy
                .clone()
                .spawn_snapshots(self.cancel.child_token()),
        );
        tasks.push(
            self.propagation()
                .clone()
                .spawn_recovery_listener(self.cancel.child_token()),
        );
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(node = %self.node.local.id, "node stopped");
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node", &self.node.local)
            .field("service", &self.service)
            .finish()
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
