//! Node selection strategies.
//!
//! A strategy picks which of the candidate nodes to contact now. Every node
//! computes the same ring from the same membership view, so ring-successor
//! selection needs no coordination.

use crate::ids::NodeInfo;
use rand::seq::SliceRandom;

pub trait NodeSelectionStrategy: Send + Sync {
    /// Pick targets among `candidates`. `local` is never returned unless the
    /// strategy deliberately targets it.
    fn select(&self, local: &NodeInfo, candidates: &[NodeInfo]) -> Vec<NodeInfo>;
}

/// The next node after `local` on the ring of candidates sorted by id.
///
/// With N nodes every node's state reaches every other node in N-1 hops.
#[derive(Clone, Copy, Debug, Default)]
pub struct RingSuccessor;

impl NodeSelectionStrategy for RingSuccessor {
    fn select(&self, local: &NodeInfo, candidates: &[NodeInfo]) -> Vec<NodeInfo> {
        let mut ring: Vec<&NodeInfo> = candidates.iter().filter(|n| n.id != local.id).collect();
        ring.sort_by(|a, b| a.id.cmp(&b.id));
        ring.dedup_by(|a, b| a.id == b.id);

        ring.iter()
            .find(|n| n.id > local.id)
            .or_else(|| ring.first())
            .map(|n| vec![(*n).clone()])
            .unwrap_or_default()
    }
}

/// Every candidate except the local node.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllNodes;

impl NodeSelectionStrategy for AllNodes {
    fn select(&self, local: &NodeInfo, candidates: &[NodeInfo]) -> Vec<NodeInfo> {
        let mut targets: Vec<NodeInfo> = candidates
            .iter()
            .filter(|n| n.id != local.id)
            .cloned()
            .collect();
        targets.sort();
        targets.dedup_by(|a, b| a.id == b.id);
        targets
    }
}

/// Up to `count` random candidates other than the local node.
#[derive(Clone, Copy, Debug)]
pub struct RandomNodes {
    pub count: usize,
}

impl NodeSelectionStrategy for RandomNodes {
    fn select(&self, local: &NodeInfo, candidates: &[NodeInfo]) -> Vec<NodeInfo> {
        let pool = AllNodes.select(local, candidates);
        pool.choose_multiple(&mut rand::thread_rng(), self.count)
            .cloned()
            .collect()
    }
}
