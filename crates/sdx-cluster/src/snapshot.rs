//! Sync checkpoints kept across restarts.
//!
//! CRDT state lives in memory only. What survives a restart is a periodic
//! checkpoint: for every replica held here, the local causal timestamp and
//! the timestamp each peer opened its last completed exchange with. A
//! restarted node pulls each checkpointed replica from a recorded peer first
//! and keeps tracking it until its state covers the checkpointed timestamp.

use crate::error::{ClusterError, Result};
use crate::ids::{NodeId, ReplicaId};
use crate::serializer::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sync progress of one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCheckpoint {
    pub replica: ReplicaId,
    /// Encoded local timestamp
    pub local: Vec<u8>,
    /// Encoded timestamp each peer opened its last exchange with
    #[serde(default)]
    pub peers: BTreeMap<NodeId, Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub node: Option<NodeId>,
    /// Unix time in milliseconds
    pub taken_at_ms: i64,
    #[serde(default)]
    pub replicas: Vec<ReplicaCheckpoint>,
}

/// A checkpoint file, written as JSON.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    serializer: Serializer,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, serializer: Serializer) -> Self {
        Self {
            path: path.into(),
            serializer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last checkpoint written, or `None` if there is none yet.
    pub fn load(&self) -> Result<Option<SyncCheckpoint>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        let checkpoint: SyncCheckpoint = self.serializer.decode(&bytes)?;
        debug!(path = %self.path.display(), replicas = checkpoint.replicas.len(), "checkpoint loaded");
        Ok(Some(checkpoint))
    }

    /// Write to a temporary file, then rename it over the previous checkpoint.
    pub async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let bytes = self.serializer.encode(checkpoint)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| io_error(&temp, e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;

        debug!(path = %self.path.display(), replicas = checkpoint.replicas.len(), "checkpoint saved");
        Ok(())
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ClusterError {
    ClusterError::Snapshot(format!("{}: {}", path.display(), err))
}
