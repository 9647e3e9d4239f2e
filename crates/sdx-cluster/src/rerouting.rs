//! Forwarding operations from non-write replicas to a write replica.

use crate::context::{NodeContext, OperationContext};
use crate::distribution::ReplicaDistributor;
use crate::error::{ClusterError, Result, RoutingFailure};
use crate::failure::FailureDetector;
use crate::ids::{NodeInfo, ReplicaId};
use crate::network::NodeClientProvider;
use crate::selection::NodeSelectionStrategy;
use std::sync::Arc;
use tracing::debug;

pub struct ReroutingService {
    node: Arc<NodeContext>,
    distributor: Arc<ReplicaDistributor>,
    clients: Arc<dyn NodeClientProvider>,
    failures: Arc<FailureDetector>,
    strategy: Box<dyn NodeSelectionStrategy>,
}

impl ReroutingService {
    pub fn new(
        node: Arc<NodeContext>,
        distributor: Arc<ReplicaDistributor>,
        clients: Arc<dyn NodeClientProvider>,
        failures: Arc<FailureDetector>,
        strategy: Box<dyn NodeSelectionStrategy>,
    ) -> Self {
        Self {
            node,
            distributor,
            clients,
            failures,
            strategy,
        }
    }

    /// Pick the write replica an operation on `replica` should go to.
    ///
    /// Fails if the operation has used up its reroute hops, or if the choice
    /// would send it back to this node or to the node it came from. Each of
    /// these means the views disagree and forwarding could loop.
    pub fn target(&self, replica: &ReplicaId, ctx: &OperationContext) -> Result<NodeInfo> {
        if ctx.hops >= self.node.config.max_reroute_hops {
            return Err(ClusterError::routing(replica, RoutingFailure::HopLimit(ctx.hops)));
        }
        let candidates: Vec<NodeInfo> = self
            .distributor
            .write_replicas(replica)
            .into_iter()
            .filter(|n| !self.failures.is_unreachable(&n.id))
            .collect();

        let target = self
            .strategy
            .select(&self.node.local, &candidates)
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::routing(replica, RoutingFailure::NoCandidates))?;

        if &target.id == self.node.id() {
            return Err(ClusterError::routing(replica, RoutingFailure::TargetIsSelf));
        }
        if ctx.origin.as_ref() == Some(&target.id) {
            return Err(ClusterError::routing(replica, RoutingFailure::TargetIsOrigin));
        }
        Ok(target)
    }

    /// Forward an encoded operation and return the encoded output.
    pub async fn reroute(&self, replica: &ReplicaId, operation: Vec<u8>, ctx: &OperationContext) -> Result<Vec<u8>> {
        ctx.ensure_active()?;
        let target = self.target(replica, ctx)?;
        debug!(%replica, to = %target.id, hops = ctx.hops, trace_id = %ctx.trace_id, "rerouting operation");

        let client = self.clients.client(&target)?;
        let call = client.reroute(replica, operation, ctx.rerouted(self.node.id()));
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(ClusterError::Cancelled),
            result = call => result,
        };
        match result {
            Ok(output) => {
                self.failures.report_success(&target);
                Ok(output)
            }
            Err(e) => {
                if e.is_unreachable() {
                    self.failures.report_unreachable(&target, &e.to_string());
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ReroutingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReroutingService")
            .field("node", &self.node.local.id)
            .finish()
    }
}
