//! Node configuration.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one cluster node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id; a ULID is generated when absent.
    pub node_id: Option<String>,
    /// Address peers use to reach this node.
    pub address: String,
    /// Shards per instance unless the instance asks otherwise.
    pub default_shard_count: u16,
    /// Write replicas per shard unless the instance asks otherwise.
    pub default_replica_count: u32,
    /// Fan-out budget given to fresh operations.
    pub propagation_budget: u32,
    /// Reroutes an operation may take before it is refused.
    pub max_reroute_hops: u32,
    /// Wait for propagation before a write returns.
    pub await_propagation: bool,
    /// How often anti-entropy runs (in milliseconds).
    pub anti_entropy_interval_ms: u64,
    /// Maximum deltas per exchanged batch.
    pub exchange_batch_size: usize,
    /// Frames buffered per direction of an exchange.
    pub exchange_channel_capacity: usize,
    /// Parked pushes kept per unreachable peer.
    pub retry_buffer_capacity: usize,
    /// Relative size change that triggers a new placement.
    pub size_change_threshold: f64,
    /// How long a node stays marked unreachable (in milliseconds).
    pub unreachable_recheck_ms: u64,
    /// Addresses tried by static discovery.
    pub static_peers: Vec<String>,
    /// File holding sync checkpoints; none disables snapshots.
    pub snapshot_path: Option<PathBuf>,
    /// How often a checkpoint is written (in milliseconds).
    pub snapshot_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            address: "127.0.0.1:7400".to_string(),
            default_shard_count: 8,
            default_replica_count: 3,
            propagation_budget: 2,
            max_reroute_hops: 3,
            await_propagation: true,
            anti_entropy_interval_ms: 1000,
            exchange_batch_size: 64,
            exchange_channel_capacity: 16,
            retry_buffer_capacity: 32,
            size_change_threshold: 0.25,
            unreachable_recheck_ms: 5000,
            static_peers: Vec::new(),
            snapshot_path: None,
            snapshot_interval_ms: 10_000,
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig =
            serde_json::from_str(json).map_err(|e| ClusterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(ClusterError::Config("address must not be empty".into()));
        }
        if matches!(&self.node_id, Some(id) if id.trim().is_empty()) {
            return Err(ClusterError::Config("node_id must not be empty".into()));
        }
        if self.default_shard_count == 0 {
            return Err(ClusterError::Config("default_shard_count must be at least 1".into()));
        }
        if self.default_replica_count == 0 {
            return Err(ClusterError::Config("default_replica_count must be at least 1".into()));
        }
        if self.anti_entropy_interval_ms == 0 || self.snapshot_interval_ms == 0 {
            return Err(ClusterError::Config(
                "anti_entropy_interval_ms and snapshot_interval_ms must be at least 1".into(),
            ));
        }
        if self.max_reroute_hops == 0 {
            return Err(ClusterError::Config("max_reroute_hops must be at least 1".into()));
        }
        if self.exchange_batch_size == 0 || self.exchange_channel_capacity == 0 {
            return Err(ClusterError::Config(
                "exchange batch size and channel capacity must be at least 1".into(),
            ));
        }
        if !self.size_change_threshold.is_finite() || self.size_change_threshold < 0.0 {
            return Err(ClusterError::Config(
                "size_change_threshold must be a finite, non-negative number".into(),
            ));
        }
        Ok(())
    }

    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms)
    }

    pub fn unreachable_recheck(&self) -> Duration {
        Duration::from_millis(self.unreachable_recheck_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Builder for node configuration.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = Some(id.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn shard_count(mut self, shards: u16) -> Self {
        self.config.default_shard_count = shards;
        self
    }

    pub fn replica_count(mut self, replicas: u32) -> Self {
        self.config.default_replica_count = replicas;
        self
    }

    pub fn propagation_budget(mut self, budget: u32) -> Self {
        self.config.propagation_budget = budget;
        self
    }

    pub fn max_reroute_hops(mut self, hops: u32) -> Self {
        self.config.max_reroute_hops = hops;
        self
    }

    pub fn await_propagation(mut self, enabled: bool) -> Self {
        self.config.await_propagation = enabled;
        self
    }

    pub fn anti_entropy_interval(mut self, ms: u64) -> Self {
        self.config.anti_entropy_interval_ms = ms;
        self
    }

    pub fn exchange_batch_size(mut self, size: usize) -> Self {
        self.config.exchange_batch_size = size;
        self
    }

    pub fn retry_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.retry_buffer_capacity = capacity;
        self
    }

    pub fn size_change_threshold(mut self, threshold: f64) -> Self {
        self.config.size_change_threshold = threshold;
        self
    }

    pub fn unreachable_recheck(mut self, ms: u64) -> Self {
        self.config.unreachable_recheck_ms = ms;
        self
    }

    pub fn static_peer(mut self, address: impl Into<String>) -> Self {
        self.config.static_peers.push(address.into());
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    pub fn snapshot_interval(mut self, ms: u64) -> Self {
        self.config.snapshot_interval_ms = ms;
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
