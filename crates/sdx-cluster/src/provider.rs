//! Type-erased access to managed instances.
//!
//! The transport side only sees bytes, so every managed instance is exposed
//! through the object-safe [`ManagedInstance`] trait. The type registry maps
//! the type names stored in instance descriptors to constructors, which is
//! how a node instantiates an instance it learned about from metadata.

use crate::context::OperationContext;
use crate::error::{ClusterError, Result};
use crate::exchange::SyncEndpoint;
use crate::ids::{InstanceId, ShardId};
use crate::managed::{ManagedCrdt, ReplicationServices};
use crate::metadata::InstanceDescriptor;
use async_trait::async_trait;
use parking_lot::RwLock;
use sdx_core::delta::{MergeResult, Operable};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait ManagedInstance: Send + Sync {
    fn instance_id(&self) -> &InstanceId;

    fn crdt_type(&self) -> &str;

    fn shard_count(&self) -> u16;

    fn replica_count(&self) -> u32;

    fn endpoint(&self, shard: ShardId) -> Result<Arc<dyn SyncEndpoint>>;

    fn merge_bytes(&self, shard: ShardId, deltas: &[u8]) -> Result<MergeResult>;

    /// Apply an encoded operation that was rerouted here.
    async fn apply_serialized(&self, shard: ShardId, operation: &[u8], ctx: OperationContext) -> Result<Vec<u8>>;

    /// Size estimate of every local shard.
    fn shard_sizes(&self) -> Vec<(ShardId, u64)>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Instances hosted by this node.
#[derive(Default)]
pub struct ManagedCrdtProvider {
    instances: RwLock<HashMap<InstanceId, Arc<dyn ManagedInstance>>>,
}

impl ManagedCrdtProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<dyn ManagedInstance>> {
        self.instances.read().get(id).cloned()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.read().contains_key(id)
    }

    /// Keep the first instance registered under an id.
    pub fn insert(&self, instance: Arc<dyn ManagedInstance>) -> Arc<dyn ManagedInstance> {
        self.instances
            .write()
            .entry(instance.instance_id().clone())
            .or_insert(instance)
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<dyn ManagedInstance>> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.instance_id().cmp(b.instance_id()));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ManagedCrdtProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<InstanceId> = self.instances.read().keys().cloned().collect();
        f.debug_struct("ManagedCrdtProvider").field("instances", &ids).finish()
    }
}

type Constructor = Arc<dyn Fn(&InstanceDescriptor, &Arc<ReplicationServices>) -> Arc<dyn ManagedInstance> + Send + Sync>;

/// Explicit mapping from type names to constructors.
#[derive(Clone, Default)]
pub struct CrdtTypeRegistry {
    constructors: HashMap<String, Constructor>,
    names: HashMap<TypeId, String>,
}

impl CrdtTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `C` under `name`. Every node must use the same names.
    pub fn register<C: Operable>(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let constructor: Constructor = Arc::new(
            |descriptor: &InstanceDescriptor, services: &Arc<ReplicationServices>| -> Arc<dyn ManagedInstance> {
                Arc::new(ManagedCrdt::<C>::new(descriptor, services.clone()))
            },
        );
        self.constructors.insert(name.clone(), constructor);
        self.names.insert(TypeId::of::<C>(), name);
        self
    }

    pub fn name_of<C: Operable>(&self) -> Result<&str> {
        self.names
            .get(&TypeId::of::<C>())
            .map(String::as_str)
            .ok_or_else(|| ClusterError::UnknownCrdtType(std::any::type_name::<C>().to_string()))
    }

    pub fn instantiate(
        &self,
        descriptor: &InstanceDescriptor,
        services: &Arc<ReplicationServices>,
    ) -> Result<Arc<dyn ManagedInstance>> {
        let constructor = self
            .constructors
            .get(&descriptor.crdt_type)
            .ok_or_else(|| ClusterError::UnknownCrdtType(descriptor.crdt_type.clone()))?;
        info!(
            instance = %descriptor.instance,
            crdt_type = %descriptor.crdt_type,
            shards = descriptor.shard_count,
            "instantiating managed crdt"
        );
        Ok(constructor(descriptor, services))
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CrdtTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
