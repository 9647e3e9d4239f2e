//! SDX Cluster - sharded replication of delta CRDTs
//!
//! Runs managed CRDT instances across a set of nodes without a coordinator:
//! - Keys hash to shards; each shard is placed on a window of the node ring
//! - Write replicas apply operations and push deltas to each other
//! - Other nodes reroute operations to a write replica
//! - Anti-entropy repairs anything pushes missed by diffing causal timestamps
//! - Cluster metadata (members, instances, sizes) replicates the same way
//!
//! # Quick Start
//!
//! ```rust
//! use sdx_cluster::{ClusterNode, CrdtTypeRegistry, MemoryNetwork, NodeConfig};
//! use sdx_core::orset::{OrSet, OrSetOperation};
//!
//! #[tokio::main]
//! async fn main() -> sdx_cluster::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let registry = CrdtTypeRegistry::new().register::<OrSet<String>>("orset<string>");
//!     let config = NodeConfig::builder().node_id("node-a").address("mem://a").build()?;
//!
//!     let node = ClusterNode::new(config, network.provider_for("mem://a"), registry)?;
//!     network.register(node.service());
//!
//!     let tags = node.create_instance::<OrSet<String>>("tags").await?;
//!     tags.execute(OrSetOperation::Add { item: "rust".to_string() }).await?;
//!
//!     let key = "rust".to_string();
//!     assert!(tags.read(&key, |set| set.contains(&key))?);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`node`] - Wiring and lifecycle of a cluster node
//! - [`managed`] / [`provider`] / [`shard`] - Sharded instances and their registry
//! - [`distribution`] - Replica placement on the node ring
//! - [`propagation`] / [`rerouting`] - Eager pushes and operation forwarding
//! - [`anti_entropy`] / [`exchange`] - Timestamp-diff repair over duplex channels
//! - [`network`] - Transport traits and the in-process network
//! - [`discovery`] - Finding peers to join
//! - [`snapshot`] - Sync checkpoints for resuming after a restart

pub mod anti_entropy;
pub mod config;
pub mod context;
pub mod discovery;
pub mod distribution;
pub mod error;
pub mod exchange;
pub mod failure;
pub mod ids;
pub mod managed;
pub mod metadata;
pub mod network;
pub mod node;
pub mod node_service;
pub mod propagation;
pub mod provider;
pub mod rerouting;
pub mod selection;
pub mod serializer;
pub mod shard;
pub mod snapshot;

pub use anti_entropy::{AntiEntropyService, SyncSummary};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use context::{NodeContext, OperationContext};
pub use discovery::{DiscoveryCandidate, DiscoveryStrategy, StaticDiscovery, Workload, WorkloadDiscovery, WorkloadLister};
pub use distribution::{ClusterView, DistributionStrategy, ReplicaDistributor, ReplicaPlacement, RingDistribution};
pub use error::{ClusterError, Result, RoutingFailure};
pub use exchange::{run_exchange, DuplexChannel, ExchangeReport, ShardEndpoint, SyncEndpoint, SyncFrame};
pub use failure::{FailureDetector, NodeEvent};
pub use ids::{InstanceId, NodeId, NodeInfo, ReplicaId, ReplicaInfo, ShardId};
pub use managed::{ManagedCrdt, ReplicationServices};
pub use metadata::{ClusterMetadata, InstanceDescriptor, MetadataKind, ReplicaHolding};
pub use network::{MemoryNetwork, NodeClient, NodeClientProvider};
pub use node::{ClusterNode, NodeStrategies};
pub use node_service::NodeService;
pub use propagation::PropagationService;
pub use provider::{CrdtTypeRegistry, ManagedCrdtProvider, ManagedInstance};
pub use rerouting::ReroutingService;
pub use selection::{AllNodes, NodeSelectionStrategy, RandomNodes, RingSuccessor};
pub use serializer::Serializer;
pub use shard::Shard;
pub use snapshot::{ReplicaCheckpoint, SnapshotStore, SyncCheckpoint};
