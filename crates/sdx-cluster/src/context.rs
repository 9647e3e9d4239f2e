//! Per-operation and per-node context objects.

use crate::config::NodeConfig;
use crate::error::{ClusterError, Result};
use crate::ids::{NodeId, NodeInfo};
use crate::serializer::Serializer;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Context threaded through every call an external write or merge causes.
///
/// Created fresh at the entry point and never persisted. The cancellation
/// token is shared by in-process calls but never serialized; a receiving
/// node behind a real transport attaches its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationContext {
    /// Node the data came from, excluded from further propagation
    pub origin: Option<NodeId>,
    /// Remaining fan-out budget
    pub await_propagation_to_n_nodes: u32,
    pub trace_id: String,
    /// Reroutes taken so far
    #[serde(default)]
    pub hops: u32,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl OperationContext {
    pub fn new(budget: u32) -> Self {
        Self {
            origin: None,
            await_propagation_to_n_nodes: budget,
            trace_id: Ulid::new().to_string(),
            hops: 0,
            cancellation: CancellationToken::new(),
        }
    }

    /// Context for anti-entropy: merges never fan out.
    pub fn for_sync(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..Self::new(0)
        }
    }

    /// Context carried by a push from `from`: one less hop to go.
    pub fn forwarded(&self, from: &NodeId) -> Self {
        Self {
            origin: Some(from.clone()),
            await_propagation_to_n_nodes: self.await_propagation_to_n_nodes.saturating_sub(1),
            trace_id: self.trace_id.clone(),
            hops: self.hops,
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Context carried by a reroute from `from`: one more hop taken, the
    /// budget is untouched.
    pub fn rerouted(&self, from: &NodeId) -> Self {
        Self {
            origin: Some(from.clone()),
            await_propagation_to_n_nodes: self.await_propagation_to_n_nodes,
            trace_id: self.trace_id.clone(),
            hops: self.hops.saturating_add(1),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Same routing data, independent cancellation.
    pub fn detached(&self) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            ..self.clone()
        }
    }

    pub fn budget(&self) -> u32 {
        self.await_propagation_to_n_nodes
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fails with [`ClusterError::Cancelled`] once the token has fired.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        Ok(())
    }
}

/// Identity, codec and configuration of the local node.
#[derive(Debug)]
pub struct NodeContext {
    pub local: NodeInfo,
    pub serializer: Serializer,
    pub config: NodeConfig,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let id = config
            .node_id
            .clone()
            .map(NodeId::new)
            .unwrap_or_else(NodeId::generate);
        Ok(Self {
            local: NodeInfo::new(id, config.address.clone()),
            serializer: Serializer,
            config,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.local.id
    }

    /// The actor under which this node mints dots and stamps.
    pub fn actor(&self) -> &str {
        self.local.id.as_str()
    }

    /// A context for an operation entering the cluster here.
    pub fn operation(&self) -> OperationContext {
        OperationContext::new(self.config.propagation_budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_decrements_budget() {
        let ctx = OperationContext::new(2);
        let hop = ctx.forwarded(&NodeId::new("a"));
        assert_eq!(hop.budget(), 1);
        assert_eq!(hop.origin, Some(NodeId::new("a")));
        assert_eq!(hop.trace_id, ctx.trace_id);

        let last = hop.forwarded(&NodeId::new("b")).forwarded(&NodeId::new("c"));
        assert_eq!(last.budget(), 0);
    }

    #[test]
    fn test_reroute_keeps_budget_and_cancellation() {
        let ctx = OperationContext::new(3);
        let rerouted = ctx.rerouted(&NodeId::new("a"));
        assert_eq!(rerouted.budget(), 3);
        assert!(rerouted.ensure_active().is_ok());

        ctx.cancellation.cancel();
        assert!(rerouted.is_cancelled());
        assert!(matches!(rerouted.ensure_active(), Err(ClusterError::Cancelled)));
        assert!(!rerouted.detached().is_cancelled());
    }

    #[test]
    fn test_hops_count_reroutes_only() {
        let ctx = OperationContext::new(2);
        assert_eq!(ctx.hops, 0);
        let twice = ctx.rerouted(&NodeId::new("a")).rerouted(&NodeId::new("b"));
        assert_eq!(twice.hops, 2);
        assert_eq!(twice.forwarded(&NodeId::new("c")).hops, 2);

        let json = serde_json::to_string(&twice).unwrap();
        let back: OperationContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hops, 2);
    }

    #[test]
    fn test_wire_form_skips_cancellation() {
        let ctx = OperationContext::new(1).forwarded(&NodeId::new("n1"));
        let json = serde_json::to_string(&ctx).unwrap();
        let back: OperationContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.origin, ctx.origin);
        assert_eq!(back.budget(), 0);
        assert!(!back.is_cancelled());
    }

    #[test]
    fn test_node_context_uses_configured_id() {
        let config = NodeConfig::builder().node_id("node-a").address("mem://a").build().unwrap();
        let node = NodeContext::new(config).unwrap();
        assert_eq!(node.id(), &NodeId::new("node-a"));
        assert_eq!(node.operation().budget(), 2);

        let generated = NodeContext::new(NodeConfig::default()).unwrap();
        assert_eq!(generated.id().as_str().len(), 26);
    }
}
