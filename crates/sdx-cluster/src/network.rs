//! Transport abstractions and the in-process transport.

use crate::error::{ClusterError, Result};
use crate::exchange::{run_exchange, DuplexChannel, ExchangeReport, SyncEndpoint};
use crate::ids::{NodeId, NodeInfo, ReplicaId};
use crate::context::OperationContext;
use crate::metadata::MetadataKind;
use crate::node_service::NodeService;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use sdx_core::delta::MergeResult;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Client side of the node-to-node protocol.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Address this client talks to.
    fn address(&self) -> &str;

    /// Push encoded deltas of one replica.
    async fn merge(&self, replica: &ReplicaId, deltas: Vec<u8>, ctx: OperationContext) -> Result<MergeResult>;

    /// Push encoded metadata deltas.
    async fn merge_metadata(
        &self,
        kind: MetadataKind,
        deltas: Vec<u8>,
        ctx: OperationContext,
    ) -> Result<MergeResult>;

    /// Execute an encoded operation remotely; returns the encoded output.
    async fn reroute(&self, replica: &ReplicaId, operation: Vec<u8>, ctx: OperationContext) -> Result<Vec<u8>>;

    /// Open a delta exchange for one replica. The returned end belongs to the caller.
    async fn exchange_deltas(&self, replica: &ReplicaId, ctx: OperationContext) -> Result<DuplexChannel>;

    async fn exchange_metadata(&self, kind: MetadataKind, ctx: OperationContext) -> Result<DuplexChannel>;

    /// Announce `joiner` and receive a snapshot of every metadata kind.
    async fn join_cluster(
        &self,
        joiner: NodeInfo,
        ctx: OperationContext,
    ) -> Result<BoxStream<'static, Result<(MetadataKind, Vec<u8>)>>>;
}

/// Resolves clients for peers.
pub trait NodeClientProvider: Send + Sync {
    fn client(&self, node: &NodeInfo) -> Result<Arc<dyn NodeClient>>;

    fn client_for_address(&self, address: &str) -> Result<Arc<dyn NodeClient>>;
}

#[derive(Default)]
struct NetworkInner {
    services: RwLock<HashMap<String, Weak<NodeService>>>,
    down: RwLock<HashSet<String>>,
    calls: RwLock<HashMap<String, usize>>,
}

/// In-process network connecting [`NodeService`]s by address.
///
/// A node marked unreachable can neither send nor receive, which models a
/// crashed or partitioned node.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client provider for the node listening at `local_address`.
    pub fn provider_for(&self, local_address: impl Into<String>) -> Arc<dyn NodeClientProvider> {
        Arc::new(MemoryClientProvider {
            network: self.clone(),
            local_address: local_address.into(),
        })
    }

    pub fn register(&self, service: &Arc<NodeService>) {
        let address = service.info().address.clone();
        debug!(%address, "service registered");
        self.inner
            .services
            .write()
            .insert(address, Arc::downgrade(service));
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut down = self.inner.down.write();
        if reachable {
            down.remove(address);
        } else {
            warn!(%address, "node cut off");
            down.insert(address.to_string());
        }
    }

    pub fn is_reachable(&self, address: &str) -> bool {
        !self.inner.down.read().contains(address)
    }

    /// Calls attempted against `address`.
    pub fn calls_to(&self, address: &str) -> usize {
        self.inner.calls.read().get(address).copied().unwrap_or(0)
    }

    fn connect(&self, from: &str, to: &str) -> Result<Arc<NodeService>> {
        *self.inner.calls.write().entry(to.to_string()).or_default() += 1;

        let service = self
            .inner
            .services
            .read()
            .get(to)
            .and_then(Weak::upgrade);
        let node = service
            .as_ref()
            .map(|s| s.info().id.clone())
            .unwrap_or_else(|| NodeId::new(to));

        if !self.is_reachable(from) || !self.is_reachable(to) {
            return Err(ClusterError::unreachable(&node, format!("{} cannot reach {}", from, to)));
        }
        service.ok_or_else(|| ClusterError::unreachable(&node, "no service at address"))
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("services", &self.inner.services.read().len())
            .field("down", &self.inner.down.read().len())
            .finish()
    }
}

struct MemoryClientProvider {
    network: MemoryNetwork,
    local_address: String,
}

impl NodeClientProvider for MemoryClientProvider {
    fn client(&self, node: &NodeInfo) -> Result<Arc<dyn NodeClient>> {
        self.client_for_address(&node.address)
    }

    fn client_for_address(&self, address: &str) -> Result<Arc<dyn NodeClient>> {
        Ok(Arc::new(MemoryClient {
            network: self.network.clone(),
            from: self.local_address.clone(),
            to: address.to_string(),
        }))
    }
}

struct MemoryClient {
    network: MemoryNetwork,
    from: String,
    to: String,
}

impl MemoryClient {
    /// A cancelled caller never reaches the peer.
    fn connect(&self, ctx: &OperationContext) -> Result<Arc<NodeService>> {
        ctx.ensure_active()?;
        self.network.connect(&self.from, &self.to)
    }
}

/// Server side of an exchange; stops when either the serving node or the
/// caller cancels.
async fn serve_exchange(
    endpoint: Arc<dyn SyncEndpoint>,
    channel: DuplexChannel,
    batch_size: usize,
    cancel: &CancellationToken,
    ctx: &OperationContext,
) -> Result<ExchangeReport> {
    tokio::select! {
        biased;
        _ = ctx.cancellation.cancelled() => Err(ClusterError::Cancelled),
        report = run_exchange(endpoint, channel, batch_size, cancel) => report,
    }
}

#[async_trait]
impl NodeClient for MemoryClient {
    fn address(&self) -> &str {
        &self.to
    }

    async fn merge(&self, replica: &ReplicaId, deltas: Vec<u8>, ctx: OperationContext) -> Result<MergeResult> {
        let service = self.connect(&ctx)?;
        service.handle_merge(replica, &deltas, ctx).await
    }

    async fn merge_metadata(
        &self,
        kind: MetadataKind,
        deltas: Vec<u8>,
        ctx: OperationContext,
    ) -> Result<MergeResult> {
        let service = self.connect(&ctx)?;
        service.handle_merge_metadata(kind, &deltas, ctx).await
    }

    async fn reroute(&self, replica: &ReplicaId, operation: Vec<u8>, ctx: OperationContext) -> Result<Vec<u8>> {
        let service = self.connect(&ctx)?;
        service.handle_reroute(replica, &operation, ctx).await
    }

    async fn exchange_deltas(&self, replica: &ReplicaId, ctx: OperationContext) -> Result<DuplexChannel> {
        let service = self.connect(&ctx)?;
        let endpoint = service.endpoint(replica)?;
        let (ours, theirs) = DuplexChannel::pair(service.config().exchange_channel_capacity);
        let batch_size = service.config().exchange_batch_size;
        let replica = replica.clone();

        tokio::spawn(async move {
            let cancel = service.cancellation();
            if let Err(e) = serve_exchange(endpoint, theirs, batch_size, &cancel, &ctx).await {
                debug!(%replica, error = %e, "server side of exchange ended early");
            }
        });
        Ok(ours)
    }

    async fn exchange_metadata(&self, kind: MetadataKind, ctx: OperationContext) -> Result<DuplexChannel> {
        let service = self.connect(&ctx)?;
        let endpoint = service.metadata_endpoint(kind);
        let (ours, theirs) = DuplexChannel::pair(service.config().exchange_channel_capacity);
        let batch_size = service.config().exchange_batch_size;

        tokio::spawn(async move {
            let cancel = service.cancellation();
            match serve_exchange(endpoint, theirs, batch_size, &cancel, &ctx).await {
                Ok(report) if report.result.is_updated() => {
                    service.refresh_topology();
                }
                Ok(_) => {}
                Err(e) => debug!(%kind, error = %e, "server side of metadata exchange ended early"),
            }
        });
        Ok(ours)
    }

    async fn join_cluster(
        &self,
        joiner: NodeInfo,
        ctx: OperationContext,
    ) -> Result<BoxStream<'static, Result<(MetadataKind, Vec<u8>)>>> {
        let service = self.connect(&ctx)?;
        let snapshots = service.handle_join(joiner, ctx).await?;
        Ok(stream::iter(snapshots.into_iter().map(Ok)).boxed())
    }
}
