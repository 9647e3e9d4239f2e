//! Periodic anti-entropy between replicas.
//!
//! Each round exchanges metadata with one member, then every replica this
//! node reads with one of the replica's other read replicas. Peers are
//! picked with the selection strategy (ring successor by default), so with
//! N replicas every update reaches every replica within N-1 rounds.
//!
//! The timestamp each peer opens an exchange with is remembered per replica
//! and written to a checkpoint on an interval. After a restart, a replica
//! named in the checkpoint is pulled from one of its recorded peers until
//! local state covers the checkpointed timestamp again.

use crate::context::{NodeContext, OperationContext};
use crate::error::{ClusterError, Result};
use crate::exchange::{run_exchange, ExchangeReport};
use crate::failure::FailureDetector;
use crate::ids::{NodeId, NodeInfo, ReplicaId};
use crate::metadata::MetadataKind;
use crate::network::NodeClientProvider;
use crate::node_service::NodeService;
use crate::selection::NodeSelectionStrategy;
use crate::snapshot::{ReplicaCheckpoint, SnapshotStore, SyncCheckpoint};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one exchange was about.
#[derive(Clone, Debug, PartialEq, Eq)]
enum SyncTarget {
    Metadata(MetadataKind),
    Replica(ReplicaId),
}

/// Totals for one anti-entropy round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub exchanges: usize,
    pub failed: usize,
    pub batches_sent: usize,
    pub batches_received: usize,
    /// Replicas whose local state changed
    pub updated: Vec<ReplicaId>,
    /// Replicas that caught up with their checkpoint this round
    pub resumed: Vec<ReplicaId>,
}

impl SyncSummary {
    fn record(&mut self, report: &ExchangeReport) {
        self.exchanges += 1;
        self.batches_sent += report.batches_sent;
        self.batches_received += report.batches_received;
    }
}

pub struct AntiEntropyService {
    node: Arc<NodeContext>,
    service: Arc<NodeService>,
    clients: Arc<dyn NodeClientProvider>,
    failures: Arc<FailureDetector>,
    strategy: Box<dyn NodeSelectionStrategy>,
    /// Peer timestamps from the last completed exchange, per replica
    progress: Mutex<BTreeMap<ReplicaId, BTreeMap<NodeId, Vec<u8>>>>,
    /// Checkpointed replicas not yet caught up after a restart
    resume: Mutex<BTreeMap<ReplicaId, ReplicaCheckpoint>>,
    snapshots: Option<SnapshotStore>,
}

impl AntiEntropyService {
    pub fn new(
        service: Arc<NodeService>,
        clients: Arc<dyn NodeClientProvider>,
        failures: Arc<FailureDetector>,
        strategy: Box<dyn NodeSelectionStrategy>,
    ) -> Self {
        Self {
            node: service.services().node.clone(),
            service,
            clients,
            failures,
            strategy,
            progress: Mutex::new(BTreeMap::new()),
            resume: Mutex::new(BTreeMap::new()),
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Resume from a checkpoint written before a restart.
    ///
    /// A checkpoint written by another node is ignored.
    pub fn restore(&self, checkpoint: SyncCheckpoint) {
        if let Some(owner) = checkpoint.node.as_ref().filter(|owner| *owner != self.node.id()) {
            warn!(%owner, "checkpoint belongs to another node, ignored");
            return;
        }
        let taken_at_ms = checkpoint.taken_at_ms;
        let mut progress = self.progress.lock();
        let mut resume = self.resume.lock();
        for entry in checkpoint.replicas {
            progress.insert(entry.replica.clone(), entry.peers.clone());
            resume.insert(entry.replica.clone(), entry);
        }
        info!(node = %self.node.local.id, replicas = resume.len(), taken_at_ms, "resuming from checkpoint");
    }

    /// Replicas still catching up with the restored checkpoint.
    pub fn pending_resume(&self) -> Vec<ReplicaId> {
        self.resume.lock().keys().cloned().collect()
    }

    /// Sync progress of every replica held here.
    ///
    /// Replicas still catching up keep their checkpointed local timestamp,
    /// so a second restart resumes toward the same target.
    pub fn checkpoint(&self) -> SyncCheckpoint {
        let distributor = &self.service.services().distributor;
        let progress = self.progress.lock();
        let resume = self.resume.lock();

        let mut replicas = Vec::new();
        for replica in distributor.replicas_held_by(self.node.id()) {
            if resume.contains_key(&replica) {
                continue;
            }
            let local = match self.service.endpoint(&replica).and_then(|e| e.timestamp_bytes()) {
                Ok(local) => local,
                Err(e) => {
                    debug!(%replica, error = %e, "replica left out of checkpoint");
                    continue;
                }
            };
            replicas.push(ReplicaCheckpoint {
                peers: progress.get(&replica).cloned().unwrap_or_default(),
                replica,
                local,
            });
        }
        for entry in resume.values() {
            replicas.push(ReplicaCheckpoint {
                peers: progress.get(&entry.replica).cloned().unwrap_or_default(),
                ..entry.clone()
            });
        }

        SyncCheckpoint {
            node: Some(self.node.id().clone()),
            taken_at_ms: chrono::Utc::now().timestamp_millis(),
            replicas,
        }
    }

    /// Write a checkpoint now. Returns `false` when snapshots are disabled.
    pub async fn save_snapshot(&self) -> Result<bool> {
        match &self.snapshots {
            Some(store) => {
                store.save(&self.checkpoint()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run one full round. Individual exchange failures are counted, not
    /// returned; only cancellation aborts the round.
    pub async fn sync_round(&self, cancel: &CancellationToken) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        let members = self.service.metadata().members();
        if let Some(peer) = self.pick(&members) {
            for kind in MetadataKind::ALL {
                self.sync_with(&peer, SyncTarget::Metadata(kind), cancel, &mut summary)
                    .await?;
            }
        }
        self.service.refresh_topology();

        if let Err(e) = self.service.publish_sizes().await {
            warn!(error = %e, "publishing replica sizes failed");
        }

        let distributor = &self.service.services().distributor;
        for replica in distributor.replicas_held_by(self.node.id()) {
            let readers = distributor.read_replicas(&replica);
            let peer = self
                .resume_peer(&replica, &readers)
                .or_else(|| self.pick(&readers));
            if let Some(peer) = peer {
                self.sync_with(&peer, SyncTarget::Replica(replica.clone()), cancel, &mut summary)
                    .await?;
            }
            if self.finish_resume(&replica) {
                summary.resumed.push(replica);
            }
        }

        debug!(
            exchanges = summary.exchanges,
            failed = summary.failed,
            sent = summary.batches_sent,
            received = summary.batches_received,
            "anti-entropy round finished"
        );
        Ok(summary)
    }

    fn pick(&self, candidates: &[NodeInfo]) -> Option<NodeInfo> {
        let reachable: Vec<NodeInfo> = candidates
            .iter()
            .filter(|n| !self.failures.is_unreachable(&n.id))
            .cloned()
            .collect();
        self.strategy
            .select(&self.node.local, &reachable)
            .into_iter()
            .next()
    }

    /// A reachable reader this replica was last synced with before a restart.
    fn resume_peer(&self, replica: &ReplicaId, readers: &[NodeInfo]) -> Option<NodeInfo> {
        let resume = self.resume.lock();
        let recorded = &resume.get(replica)?.peers;
        readers
            .iter()
            .find(|n| {
                &n.id != self.node.id() && recorded.contains_key(&n.id) && !self.failures.is_unreachable(&n.id)
            })
            .cloned()
    }

    /// Drop `replica` from the resume set once local state covers its
    /// checkpoint. Returns `true` if it was dropped.
    fn finish_resume(&self, replica: &ReplicaId) -> bool {
        let mut resume = self.resume.lock();
        let covered = match resume.get(replica) {
            Some(entry) => self
                .service
                .endpoint(replica)
                .and_then(|endpoint| endpoint.covers(&entry.local)),
            None => return false,
        };
        match covered {
            Ok(true) => {
                resume.remove(replica);
                info!(%replica, "replica caught up with checkpoint");
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(%replica, error = %e, "cannot compare with checkpoint");
                false
            }
        }
    }

    async fn sync_with(
        &self,
        peer: &NodeInfo,
        target: SyncTarget,
        cancel: &CancellationToken,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        match self.exchange(peer, &target, cancel).await {
            Ok(report) => {
                self.failures.report_success(peer);
                summary.record(&report);
                let updated = report.result.is_updated();
                match target {
                    SyncTarget::Metadata(_) => {
                        if updated {
                            self.service.refresh_topology();
                        }
                    }
                    SyncTarget::Replica(replica) => {
                        self.progress
                            .lock()
                            .entry(replica.clone())
                            .or_default()
                            .insert(peer.id.clone(), report.peer_timestamp);
                        if updated {
                            summary.updated.push(replica);
                        }
                    }
                }
                Ok(())
            }
            Err(ClusterError::Cancelled) => Err(ClusterError::Cancelled),
            Err(e) => {
                if e.is_unreachable() {
                    self.failures.report_unreachable(peer, &e.to_string());
                }
                debug!(node = %peer.id, sync = ?target, error = %e, "exchange failed");
                summary.failed += 1;
                Ok(())
            }
        }
    }

    async fn exchange(
        &self,
        peer: &NodeInfo,
        target: &SyncTarget,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        let client = self.clients.client(peer)?;
        let ctx = OperationContext::for_sync(cancel.child_token());
        let batch_size = self.node.config.exchange_batch_size;

        let (channel, endpoint) = match target {
            SyncTarget::Metadata(kind) => (
                client.exchange_metadata(*kind, ctx).await?,
                self.service.metadata_endpoint(*kind),
            ),
            SyncTarget::Replica(replica) => (
                client.exchange_deltas(replica, ctx).await?,
                self.service.endpoint(replica)?,
            ),
        };
        run_exchange(endpoint, channel, batch_size, cancel).await
    }

    /// Run rounds on the configured interval until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.node.config.anti_entropy_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(node = %self.node.local.id, period_ms = period.as_millis() as u64, "anti-entropy started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.sync_round(&cancel).await {
                    Ok(_) => {}
                    Err(ClusterError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "anti-entropy round failed"),
                }
            }
            info!(node = %self.node.local.id, "anti-entropy stopped");
        })
    }

    /// Write checkpoints on the configured interval, and once more when
    /// `cancel` fires. `None` when snapshots are disabled.
    pub fn spawn_snapshots(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.snapshots.as_ref()?;
        let period = self.node.config.snapshot_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.save_snapshot().await {
                    warn!(error = %e, "writing checkpoint failed");
                }
            }
            if let Err(e) = self.save_snapshot().await {
                warn!(error = %e, "final checkpoint failed");
            }
        }))
    }
}

impl std::fmt::Debug for AntiEntropyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropyService")
            .field("node", &self.node.local.id)
            .finish()
    }
}
