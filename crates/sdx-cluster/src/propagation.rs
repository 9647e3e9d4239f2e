//! Eager delta propagation to a shard's other write replicas.
//!
//! The fan-out budget in the operation context bounds how far a push
//! travels: each hop forwards with one less, and a zero budget stops.
//! Pushes to unreachable peers are parked in a bounded per-peer buffer and
//! replayed before the next push to that peer or when it recovers. Anything
//! beyond that is left to anti-entropy. A cancelled context stops sending;
//! pushes already delivered stay delivered.

use crate::context::{NodeContext, OperationContext};
use crate::distribution::ReplicaDistributor;
use crate::error::{ClusterError, Result};
use crate::failure::{FailureDetector, NodeEvent};
use crate::ids::{NodeId, NodeInfo, ReplicaId};
use crate::metadata::MetadataKind;
use crate::network::NodeClientProvider;
use crate::selection::NodeSelectionStrategy;
use futures::future::join_all;
use parking_lot::Mutex;
use sdx_core::delta::MergeResult;
use sdx_delta::buffer::RetryBuffer;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a push lands on the receiving node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushTarget {
    Replica(ReplicaId),
    Metadata(MetadataKind),
}

/// A push waiting for its peer to come back.
#[derive(Clone, Debug)]
pub struct ParkedPush {
    pub target: PushTarget,
    pub deltas: Vec<u8>,
    pub ctx: OperationContext,
}

pub struct PropagationService {
    node: Arc<NodeContext>,
    distributor: Arc<ReplicaDistributor>,
    clients: Arc<dyn NodeClientProvider>,
    failures: Arc<FailureDetector>,
    strategy: Box<dyn NodeSelectionStrategy>,
    retry: Mutex<RetryBuffer<NodeId, ParkedPush>>,
}

impl PropagationService {
    pub fn new(
        node: Arc<NodeContext>,
        distributor: Arc<ReplicaDistributor>,
        clients: Arc<dyn NodeClientProvider>,
        failures: Arc<FailureDetector>,
        strategy: Box<dyn NodeSelectionStrategy>,
    ) -> Self {
        let capacity = node.config.retry_buffer_capacity;
        Self {
            node,
            distributor,
            clients,
            failures,
            strategy,
            retry: Mutex::new(RetryBuffer::new(capacity)),
        }
    }

    /// Push encoded deltas of `replica` to its other write replicas.
    ///
    /// Returns how many peers accepted the push. Fails with the first
    /// unreachable error after every push has been attempted.
    pub async fn propagate(&self, replica: &ReplicaId, deltas: Vec<u8>, ctx: &OperationContext) -> Result<usize> {
        ctx.ensure_active()?;
        if ctx.budget() == 0 {
            debug!(%replica, trace_id = %ctx.trace_id, "propagation budget exhausted");
            return Ok(0);
        }
        let peers = self.distributor.write_replicas(replica);
        self.push_all(PushTarget::Replica(replica.clone()), peers, deltas, ctx).await
    }

    /// Push encoded metadata deltas to the other cluster members.
    pub async fn propagate_metadata(
        &self,
        kind: MetadataKind,
        deltas: Vec<u8>,
        ctx: &OperationContext,
    ) -> Result<usize> {
        ctx.ensure_active()?;
        if ctx.budget() == 0 {
            return Ok(0);
        }
        let peers = self.distributor.nodes();
        self.push_all(PushTarget::Metadata(kind), peers, deltas, ctx).await
    }

    async fn push_all(
        &self,
        target: PushTarget,
        peers: Vec<NodeInfo>,
        deltas: Vec<u8>,
        ctx: &OperationContext,
    ) -> Result<usize> {
        let local = self.node.id();
        let forwarded = ctx.forwarded(local);
        let not_origin = |n: &NodeInfo| ctx.origin.as_ref() != Some(&n.id);

        let (down, candidates): (Vec<NodeInfo>, Vec<NodeInfo>) = peers
            .into_iter()
            .filter(|n| &n.id != local && not_origin(n))
            .partition(|n| self.failures.is_unreachable(&n.id));

        for peer in &down {
            self.park(peer, ParkedPush {
                target: target.clone(),
                deltas: deltas.clone(),
                ctx: forwarded.detached(),
            });
        }

        let targets: Vec<NodeInfo> = self
            .strategy
            .select(&self.node.local, &candidates)
            .into_iter()
            .filter(|n| not_origin(n))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }
        debug!(
            push = ?target,
            peers = targets.len(),
            budget = forwarded.budget(),
            trace_id = %ctx.trace_id,
            "propagating deltas"
        );

        let pushes = targets.into_iter().map(|peer| {
            let push = ParkedPush {
                target: target.clone(),
                deltas: deltas.clone(),
                ctx: forwarded.clone(),
            };
            async move {
                let result = self.deliver(&peer, push).await;
                (peer, result)
            }
        });

        let outcomes = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => {
                debug!(push = ?target, trace_id = %ctx.trace_id, "propagation cancelled");
                return Err(ClusterError::Cancelled);
            }
            outcomes = join_all(pushes) => outcomes,
        };

        let mut delivered = 0;
        let mut first_error = None;
        for (peer, result) in outcomes {
            match result {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!(node = %peer.id, error = %e, "push failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    async fn deliver(&self, peer: &NodeInfo, push: ParkedPush) -> Result<MergeResult> {
        self.replay(peer).await;
        push.ctx.ensure_active()?;
        match self.send(peer, &push).await {
            Ok(result) => {
                self.failures.report_success(peer);
                Ok(result)
            }
            Err(e) if e.is_unreachable() => {
                self.failures.report_unreachable(peer, &e.to_string());
                self.park(peer, ParkedPush {
                    ctx: push.ctx.detached(),
                    ..push
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn send(&self, peer: &NodeInfo, push: &ParkedPush) -> Result<MergeResult> {
        let client = self.clients.client(peer)?;
        match &push.target {
            PushTarget::Replica(replica) => client.merge(replica, push.deltas.clone(), push.ctx.clone()).await,
            PushTarget::Metadata(kind) => {
                client
                    .merge_metadata(*kind, push.deltas.clone(), push.ctx.clone())
                    .await
            }
        }
    }

    fn park(&self, peer: &NodeInfo, push: ParkedPush) {
        if let Some(evicted) = self.retry.lock().push(peer.id.clone(), push) {
            warn!(
                node = %peer.id,
                seq = evicted.seq,
                push = ?evicted.payload.target,
                "retry buffer full, oldest push dropped"
            );
        }
    }

    /// Send everything parked for `peer`, oldest first. Stops at the first
    /// failure and keeps the rest parked. Returns the number delivered.
    pub async fn flush(&self, peer: &NodeInfo) -> usize {
        self.replay(peer).await
    }

    async fn replay(&self, peer: &NodeInfo) -> usize {
        let parked = self.retry.lock().drain(&peer.id);
        if parked.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut remaining = parked.into_iter();
        while let Some(push) = remaining.next() {
            if let Err(e) = self.send(peer, &push.payload).await {
                debug!(node = %peer.id, error = %e, "replay interrupted");
                let mut rest = vec![push];
                rest.extend(remaining);
                self.retry.lock().requeue(peer.id.clone(), rest);
                return delivered;
            }
            delivered += 1;
        }
        info!(node = %peer.id, delivered, "parked pushes replayed");
        delivered
    }

    pub fn pending_for(&self, peer: &NodeId) -> usize {
        self.retry.lock().pending_for(peer)
    }

    /// Replay parked pushes whenever a peer is reported recovered.
    pub fn spawn_recovery_listener(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.failures.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(NodeEvent::Recovered(peer)) => {
                        self.flush(&peer).await;
                    }
                    Ok(NodeEvent::Unreachable(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recovery listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for PropagationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationService")
            .field("node", &self.node.local.id)
            .field("parked", &self.retry.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::distribution::{ClusterView, RingDistribution};
    use crate::exchange::DuplexChannel;
    use crate::ids::{InstanceId, ReplicaInfo};
    use crate::network::NodeClient;
    use crate::selection::AllNodes;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Records merges per address; addresses in `down` fail as unreachable.
    #[derive(Default)]
    struct Recorder {
        merges: Mutex<Vec<(String, u32, Option<NodeId>)>>,
        down: Mutex<HashSet<String>>,
    }

    struct RecordingClient {
        to: String,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl NodeClient for RecordingClient {
        fn address(&self) -> &str {
            &self.to
        }

        async fn merge(&self, _: &ReplicaId, _: Vec<u8>, ctx: OperationContext) -> Result<MergeResult> {
            if self.recorder.down.lock().contains(&self.to) {
                return Err(ClusterError::unreachable(&NodeId::new(self.to.clone()), "down"));
            }
            self.recorder
                .merges
                .lock()
                .push((self.to.clone(), ctx.budget(), ctx.origin.clone()));
            Ok(MergeResult::StateUpdated)
        }

        async fn merge_metadata(&self, _: MetadataKind, _: Vec<u8>, _: OperationContext) -> Result<MergeResult> {
            Ok(MergeResult::StateNotChanged)
        }

        async fn reroute(&self, _: &ReplicaId, _: Vec<u8>, _: OperationContext) -> Result<Vec<u8>> {
            unreachable!("propagation never reroutes")
        }

        async fn exchange_deltas(&self, _: &ReplicaId, _: OperationContext) -> Result<DuplexChannel> {
            unreachable!("propagation never exchanges")
        }

        async fn exchange_metadata(&self, _: MetadataKind, _: OperationContext) -> Result<DuplexChannel> {
            unreachable!("propagation never exchanges")
        }

        async fn join_cluster(
            &self,
            _: NodeInfo,
            _: OperationContext,
        ) -> Result<BoxStream<'static, Result<(MetadataKind, Vec<u8>)>>> {
            unreachable!("propagation never joins")
        }
    }

    impl NodeClientProvider for Arc<Recorder> {
        fn client(&self, node: &NodeInfo) -> Result<Arc<dyn NodeClient>> {
            self.client_for_address(&node.address)
        }

        fn client_for_address(&self, address: &str) -> Result<Arc<dyn NodeClient>> {
            Ok(Arc::new(RecordingClient {
                to: address.to_string(),
                recorder: self.clone(),
            }))
        }
    }

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::new(id), id)
    }

    fn replica() -> ReplicaId {
        ReplicaId::new(InstanceId::new("inst"), 0)
    }

    fn service(recorder: &Arc<Recorder>, capacity: usize) -> PropagationService {
        let config = NodeConfig::builder()
            .node_id("a")
            .address("a")
            .retry_buffer_capacity(capacity)
            .unreachable_recheck(60_000)
            .build()
            .unwrap();
        let local = Arc::new(NodeContext::new(config).unwrap());
        let distributor = Arc::new(ReplicaDistributor::new(Box::new(RingDistribution), 0.25));
        distributor.update(ClusterView {
            nodes: vec![node("a"), node("b"), node("c"), node("d")],
            replicas: vec![ReplicaInfo {
                replica: replica(),
                size: 0,
                requested_replicas: 3,
            }],
            holders: Default::default(),
        });
        PropagationService::new(
            local,
            distributor,
            Arc::new(recorder.clone()),
            Arc::new(FailureDetector::new(Duration::from_secs(60))),
            Box::new(AllNodes),
        )
    }

    #[tokio::test]
    async fn test_pushes_to_other_write_replicas_with_decremented_budget() {
        let recorder = Arc::new(Recorder::default());
        let propagation = service(&recorder, 4);

        let delivered = propagation
            .propagate(&replica(), b"[]".to_vec(), &OperationContext::new(2))
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        let mut merges = recorder.merges.lock().clone();
        merges.sort();
        assert_eq!(
            merges,
            vec![
                ("b".to_string(), 1, Some(NodeId::new("a"))),
                ("c".to_string(), 1, Some(NodeId::new("a"))),
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_budget_and_origin_are_respected() {
        let recorder = Arc::new(Recorder::default());
        let propagation = service(&recorder, 4);

        propagation
            .propagate(&replica(), b"[]".to_vec(), &OperationContext::new(0))
            .await
            .unwrap();
        assert!(recorder.merges.lock().is_empty());

        let from_b = OperationContext::new(2).forwarded(&NodeId::new("b"));
        propagation.propagate(&replica(), b"[]".to_vec(), &from_b).await.unwrap();
        let merges = recorder.merges.lock().clone();
        assert_eq!(merges, vec![("c".to_string(), 0, Some(NodeId::new("a")))]);
    }

    #[tokio::test]
    async fn test_cancelled_context_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let propagation = service(&recorder, 4);
        recorder.down.lock().insert("c".to_string());

        let ctx = OperationContext::new(2);
        ctx.cancellation.cancel();
        let err = propagation
            .propagate(&replica(), b"[]".to_vec(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));

        let err = propagation
            .propagate_metadata(MetadataKind::Membership, b"[]".to_vec(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));

        assert!(recorder.merges.lock().is_empty());
        assert_eq!(propagation.pending_for(&NodeId::new("c")), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_parked_and_replayed() {
        let recorder = Arc::new(Recorder::default());
        let propagation = service(&recorder, 2);
        recorder.down.lock().insert("c".to_string());

        let err = propagation
            .propagate(&replica(), b"[1]".to_vec(), &OperationContext::new(2))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(propagation.pending_for(&NodeId::new("c")), 1);

        // marked peers are parked without being contacted
        for _ in 0..2 {
            propagation
                .propagate(&replica(), b"[2]".to_vec(), &OperationContext::new(2))
                .await
                .unwrap();
        }
        assert_eq!(propagation.pending_for(&NodeId::new("c")), 2);

        recorder.down.lock().clear();
        assert_eq!(propagation.flush(&node("c")).await, 2);
        assert_eq!(propagation.pending_for(&NodeId::new("c")), 0);
        let to_c = recorder.merges.lock().iter().filter(|m| m.0 == "c").count();
        assert_eq!(to_c, 2);
    }
}
