//! Replica placement.
//!
//! Every node computes placement locally from the same inputs (membership,
//! replica sizes and holders), so placement must be a pure function of them.

use crate::ids::{NodeId, NodeInfo, ReplicaId, ReplicaInfo};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Write and read replica sets of one shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaPlacement {
    /// Nodes accepting local mutations, sorted by id
    pub write: Vec<NodeInfo>,
    /// Write nodes plus live nodes still holding data, sorted by id
    pub read: Vec<NodeInfo>,
}

/// Nodes reporting stored data per replica.
pub type Holders = BTreeMap<ReplicaId, BTreeSet<NodeId>>;

pub trait DistributionStrategy: Send + Sync {
    fn distribute(
        &self,
        replicas: &[ReplicaInfo],
        nodes: &[NodeInfo],
        holders: &Holders,
    ) -> BTreeMap<ReplicaId, ReplicaPlacement>;
}

/// Consecutive windows on the id-sorted ring.
///
/// Replicas are placed largest first (ties by id). The window start walks the
/// ring forward then backward (0, 1, .., n-1, n-1, .., 0, 0, 1, ..) so the
/// biggest replicas do not pile up on the same nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RingDistribution;

impl DistributionStrategy for RingDistribution {
    fn distribute(
        &self,
        replicas: &[ReplicaInfo],
        nodes: &[NodeInfo],
        holders: &Holders,
    ) -> BTreeMap<ReplicaId, ReplicaPlacement> {
        let mut ring: Vec<NodeInfo> = nodes.to_vec();
        ring.sort();
        ring.dedup_by(|a, b| a.id == b.id);
        let n = ring.len();

        let mut order: Vec<&ReplicaInfo> = replicas.iter().collect();
        order.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.replica.cmp(&b.replica)));

        let mut plan = BTreeMap::new();
        for (k, info) in order.into_iter().enumerate() {
            if n == 0 {
                plan.insert(info.replica.clone(), ReplicaPlacement::default());
                continue;
            }
            let cycle = k % (2 * n);
            let start = if cycle < n { cycle } else { 2 * n - 1 - cycle };
            let window = (info.requested_replicas.max(1) as usize).min(n);

            let mut write: Vec<NodeInfo> = (0..window).map(|i| ring[(start + i) % n].clone()).collect();
            write.sort();

            let mut read = write.clone();
            if let Some(held_by) = holders.get(&info.replica) {
                for node in ring.iter().filter(|node| held_by.contains(&node.id)) {
                    if !read.iter().any(|r| r.id == node.id) {
                        read.push(node.clone());
                    }
                }
            }
            read.sort();

            plan.insert(info.replica.clone(), ReplicaPlacement { write, read });
        }
        plan
    }
}

/// Inputs the current plan was computed from.
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    pub nodes: Vec<NodeInfo>,
    pub replicas: Vec<ReplicaInfo>,
    pub holders: Holders,
}

#[derive(Default)]
struct DistributorState {
    nodes: Vec<NodeInfo>,
    replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    holders: Holders,
    plan: BTreeMap<ReplicaId, ReplicaPlacement>,
    epoch: u64,
}

/// Caches the placement plan and recomputes it only on meaningful change.
pub struct ReplicaDistributor {
    strategy: Box<dyn DistributionStrategy>,
    size_change_threshold: f64,
    state: RwLock<DistributorState>,
}

impl ReplicaDistributor {
    pub fn new(strategy: Box<dyn DistributionStrategy>, size_change_threshold: f64) -> Self {
        Self {
            strategy,
            size_change_threshold,
            state: RwLock::new(DistributorState::default()),
        }
    }

    /// Feed a new view. Returns `true` when the plan was recomputed.
    pub fn update(&self, view: ClusterView) -> bool {
        let mut nodes = view.nodes;
        nodes.sort();
        nodes.dedup_by(|a, b| a.id == b.id);
        let replicas: BTreeMap<ReplicaId, ReplicaInfo> = view
            .replicas
            .into_iter()
            .map(|info| (info.replica.clone(), info))
            .collect();

        let mut state = self.state.write();
        if state.epoch > 0 && !self.is_meaningful(&state, &nodes, &replicas, &view.holders) {
            return false;
        }

        let inputs: Vec<ReplicaInfo> = replicas.values().cloned().collect();
        let plan = self.strategy.distribute(&inputs, &nodes, &view.holders);
        state.epoch += 1;
        info!(
            epoch = state.epoch,
            nodes = nodes.len(),
            replicas = replicas.len(),
            "replica placement recomputed"
        );

        state.nodes = nodes;
        state.replicas = replicas;
        state.holders = view.holders;
        state.plan = plan;
        true
    }

    fn is_meaningful(
        &self,
        state: &DistributorState,
        nodes: &[NodeInfo],
        replicas: &BTreeMap<ReplicaId, ReplicaInfo>,
        holders: &Holders,
    ) -> bool {
        if state.nodes.as_slice() != nodes || state.holders != *holders {
            return true;
        }
        if state.replicas.len() != replicas.len() {
            return true;
        }
        for (id, info) in replicas {
            let Some(previous) = state.replicas.get(id) else {
                return true;
            };
            if previous.requested_replicas != info.requested_replicas {
                return true;
            }
            let base = previous.size.max(1) as f64;
            let change = (info.size as f64 - previous.size as f64).abs() / base;
            if change > self.size_change_threshold {
                debug!(replica = %id, from = previous.size, to = info.size, "size change above threshold");
                return true;
            }
        }
        false
    }

    pub fn placement(&self, replica: &ReplicaId) -> ReplicaPlacement {
        self.state
            .read()
            .plan
            .get(replica)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_replicas(&self, replica: &ReplicaId) -> Vec<NodeInfo> {
        self.placement(replica).write
    }

    pub fn read_replicas(&self, replica: &ReplicaId) -> Vec<NodeInfo> {
        self.placement(replica).read
    }

    pub fn is_write_replica(&self, replica: &ReplicaId, node: &NodeId) -> bool {
        self.state
            .read()
            .plan
            .get(replica)
            .is_some_and(|p| p.write.iter().any(|n| &n.id == node))
    }

    pub fn is_read_replica(&self, replica: &ReplicaId, node: &NodeId) -> bool {
        self.state
            .read()
            .plan
            .get(replica)
            .is_some_and(|p| p.read.iter().any(|n| &n.id == node))
    }

    /// Replicas `node` should hold a copy of.
    pub fn replicas_held_by(&self, node: &NodeId) -> Vec<ReplicaId> {
        self.state
            .read()
            .plan
            .iter()
            .filter(|(_, p)| p.read.iter().any(|n| &n.id == node))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Membership the current plan was computed for.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.state.read().nodes.clone()
    }

    /// Number of times the plan has been computed.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }
}

impl std::fmt::Debug for ReplicaDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ReplicaDistributor")
            .field("epoch", &state.epoch)
            .field("nodes", &state.nodes.len())
            .field("replicas", &state.replicas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstanceId;

    fn nodes(ids: &[&str]) -> Vec<NodeInfo> {
        ids.iter()
            .map(|id| NodeInfo::new(NodeId::new(*id), format!("mem://{}", id)))
            .collect()
    }

    fn replica(shard: u16) -> ReplicaId {
        ReplicaId::new(InstanceId::new("inst"), shard)
    }

    fn info(shard: u16, size: u64, requested: u32) -> ReplicaInfo {
        ReplicaInfo {
            replica: replica(shard),
            size,
            requested_replicas: requested,
        }
    }

    fn ids(placement: &[NodeInfo]) -> Vec<&str> {
        placement.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_windows_walk_forward_then_backward() {
        let ring = nodes(&["A", "B", "C"]);
        let replicas: Vec<ReplicaInfo> = (0..6).map(|s| info(s, 0, 1)).collect();
        let plan = RingDistribution.distribute(&replicas, &ring, &Holders::new());

        let starts: Vec<&str> = (0..6).map(|s| ids(&plan[&replica(s)].write)[0]).collect();
        assert_eq!(starts, vec!["A", "B", "C", "C", "B", "A"]);
    }

    #[test]
    fn test_largest_replica_placed_first() {
        let ring = nodes(&["A", "B", "C"]);
        let replicas = vec![info(0, 10, 2), info(1, 500, 2)];
        let plan = RingDistribution.distribute(&replicas, &ring, &Holders::new());

        assert_eq!(ids(&plan[&replica(1)].write), vec!["A", "B"]);
        assert_eq!(ids(&plan[&replica(0)].write), vec!["B", "C"]);
    }

    #[test]
    fn test_window_capped_by_cluster_size() {
        let ring = nodes(&["A", "B"]);
        let plan = RingDistribution.distribute(&[info(0, 0, 5)], &ring, &Holders::new());
        assert_eq!(ids(&plan[&replica(0)].write), vec!["A", "B"]);

        let empty = RingDistribution.distribute(&[info(0, 0, 5)], &[], &Holders::new());
        assert!(empty[&replica(0)].write.is_empty());
    }

    #[test]
    fn test_read_replicas_include_live_holders() {
        let ring = nodes(&["A", "B", "C"]);
        let mut holders = Holders::new();
        holders.insert(
            replica(0),
            [NodeId::new("C"), NodeId::new("gone")].into_iter().collect(),
        );
        let plan = RingDistribution.distribute(&[info(0, 0, 1)], &ring, &holders);

        assert_eq!(ids(&plan[&replica(0)].write), vec!["A"]);
        assert_eq!(ids(&plan[&replica(0)].read), vec!["A", "C"]);
    }

    #[test]
    fn test_placement_is_deterministic() {
        let replicas: Vec<ReplicaInfo> = (0..5).map(|s| info(s, u64::from(s) * 7 % 3, 2)).collect();
        let forward = RingDistribution.distribute(&replicas, &nodes(&["A", "B", "C"]), &Holders::new());
        let mut shuffled = replicas.clone();
        shuffled.reverse();
        let backward = RingDistribution.distribute(&shuffled, &nodes(&["C", "B", "A"]), &Holders::new());
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_distributor_ignores_small_size_drift() {
        let distributor = ReplicaDistributor::new(Box::new(RingDistribution), 0.5);
        let view = |size| ClusterView {
            nodes: nodes(&["A", "B"]),
            replicas: vec![info(0, size, 1)],
            holders: Holders::new(),
        };

        assert!(distributor.update(view(100)));
        assert!(!distributor.update(view(100)));
        assert!(!distributor.update(view(140)));
        assert!(distributor.update(view(200)));
        assert_eq!(distributor.epoch(), 2);

        let grown = ClusterView {
            nodes: nodes(&["A", "B", "C"]),
            ..view(200)
        };
        assert!(distributor.update(grown));
        assert!(distributor.is_write_replica(&replica(0), &NodeId::new("A")));
        assert!(!distributor.is_read_replica(&replica(0), &NodeId::new("B")));
        assert_eq!(distributor.replicas_held_by(&NodeId::new("A")), vec![replica(0)]);
    }
}
