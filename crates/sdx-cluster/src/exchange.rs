//! Duplex delta exchange between two replicas of the same shard.
//!
//! Both sides open by sending their causal timestamp. Each then streams only
//! the deltas the other has not seen, in bounded batches, and closes its
//! half with `Done`. The halves run concurrently, so neither side waits for
//! the other to finish sending before it starts merging.

use crate::error::{ClusterError, Result};
use crate::serializer::Serializer;
use crate::shard::Shard;
use futures::stream::{BoxStream, StreamExt};
use sdx_core::delta::{DeltaCrdt, MergeResult};
use sdx_core::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Byte-level view of one replica, independent of its CRDT type.
pub trait SyncEndpoint: Send + Sync {
    fn timestamp_bytes(&self) -> Result<Vec<u8>>;

    /// Encoded delta batches the holder of `peer_timestamp` is missing.
    fn delta_stream(
        &self,
        peer_timestamp: &[u8],
        max: usize,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>>;

    /// Merge one encoded delta batch.
    fn merge_bytes(&self, batch: &[u8]) -> Result<MergeResult>;

    /// Has everything `timestamp` reflects been merged here?
    fn covers(&self, timestamp: &[u8]) -> Result<bool>;
}

/// Exposes a typed shard as a [`SyncEndpoint`].
pub struct ShardEndpoint<C> {
    shard: Arc<Shard<C>>,
    serializer: Serializer,
}

impl<C: DeltaCrdt> ShardEndpoint<C> {
    pub fn new(shard: Arc<Shard<C>>, serializer: Serializer) -> Self {
        Self { shard, serializer }
    }
}

impl<C: DeltaCrdt> SyncEndpoint for ShardEndpoint<C> {
    fn timestamp_bytes(&self) -> Result<Vec<u8>> {
        self.serializer.encode(&self.shard.timestamp())
    }

    fn delta_stream(
        &self,
        peer_timestamp: &[u8],
        max: usize,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let since: C::Timestamp = self.serializer.decode(peer_timestamp)?;
        let serializer = self.serializer;
        Ok(self
            .shard
            .clone()
            .delta_stream(since, max)
            .map(move |batch| serializer.encode(&batch))
            .boxed())
    }

    fn merge_bytes(&self, batch: &[u8]) -> Result<MergeResult> {
        let deltas: Vec<C::Delta> = self.serializer.decode(batch)?;
        Ok(self.shard.merge_all(deltas))
    }

    fn covers(&self, timestamp: &[u8]) -> Result<bool> {
        let other: C::Timestamp = self.serializer.decode(timestamp)?;
        Ok(other.leq(&self.shard.timestamp()))
    }
}

/// A frame on an exchange channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "payload")]
pub enum SyncFrame {
    Timestamp(Vec<u8>),
    Deltas(Vec<u8>),
    Done,
}

impl SyncFrame {
    fn name(&self) -> &'static str {
        match self {
            SyncFrame::Timestamp(_) => "timestamp",
            SyncFrame::Deltas(_) => "deltas",
            SyncFrame::Done => "done",
        }
    }
}

/// One end of a bidirectional frame channel.
#[derive(Debug)]
pub struct DuplexChannel {
    pub tx: mpsc::Sender<SyncFrame>,
    pub rx: mpsc::Receiver<SyncFrame>,
}

impl DuplexChannel {
    /// Two connected ends.
    pub fn pair(capacity: usize) -> (DuplexChannel, DuplexChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (
            DuplexChannel { tx: a_tx, rx: b_rx },
            DuplexChannel { tx: b_tx, rx: a_rx },
        )
    }
}

/// What one side of an exchange did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeReport {
    pub batches_sent: usize,
    pub batches_received: usize,
    pub result: MergeResult,
    /// Timestamp the peer opened with
    pub peer_timestamp: Vec<u8>,
}

/// Run one side of an exchange to completion or cancellation.
///
/// On cancellation the exchange stops early; batches merged so far stay
/// merged.
pub async fn run_exchange(
    endpoint: Arc<dyn SyncEndpoint>,
    channel: DuplexChannel,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<ExchangeReport> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClusterError::Cancelled),
        result = exchange(endpoint, channel, batch_size) => result,
    }
}

async fn exchange(
    endpoint: Arc<dyn SyncEndpoint>,
    channel: DuplexChannel,
    batch_size: usize,
) -> Result<ExchangeReport> {
    let DuplexChannel { tx, mut rx } = channel;

    tx.send(SyncFrame::Timestamp(endpoint.timestamp_bytes()?))
        .await
        .map_err(|_| violation("peer closed before our timestamp"))?;

    let peer_timestamp = match rx.recv().await {
        Some(SyncFrame::Timestamp(bytes)) => bytes,
        Some(frame) => {
            return Err(violation(format!("expected timestamp, got {}", frame.name())));
        }
        None => return Err(violation("peer closed before its timestamp")),
    };
    let mut outgoing = endpoint.delta_stream(&peer_timestamp, batch_size)?;

    let send = async move {
        let mut sent = 0;
        while let Some(batch) = outgoing.next().await {
            tx.send(SyncFrame::Deltas(batch?))
                .await
                .map_err(|_| violation("peer closed mid-stream"))?;
            sent += 1;
        }
        tx.send(SyncFrame::Done)
            .await
            .map_err(|_| violation("peer closed before done"))?;
        Ok::<usize, ClusterError>(sent)
    };

    let receiving = endpoint.clone();
    let receive = async move {
        let mut received = 0;
        let mut result = MergeResult::StateNotChanged;
        loop {
            match rx.recv().await {
                Some(SyncFrame::Deltas(batch)) => {
                    received += 1;
                    result = result.or(receiving.merge_bytes(&batch)?);
                }
                Some(SyncFrame::Done) => break,
                Some(SyncFrame::Timestamp(_)) => {
                    return Err(violation("second timestamp in one exchange"));
                }
                None => return Err(violation("peer closed before done")),
            }
        }
        Ok::<(usize, MergeResult), ClusterError>((received, result))
    };

    let (sent, received) = tokio::join!(send, receive);
    let batches_sent = sent?;
    let (batches_received, result) = received?;
    debug!(batches_sent, batches_received, updated = result.is_updated(), "exchange finished");
    Ok(ExchangeReport {
        batches_sent,
        batches_received,
        result,
        peer_timestamp,
    })
}

fn violation(reason: impl Into<String>) -> ClusterError {
    let reason = reason.into();
    error!(%reason, "sync protocol violation");
    ClusterError::ProtocolViolation(reason)
}
