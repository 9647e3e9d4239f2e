//! One shard of a managed CRDT: the state behind its lock.

use crate::ids::ShardId;
use async_stream::stream;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use sdx_core::delta::{next_batch, DeltaCrdt, MergeResult, Operable};
use std::sync::Arc;
use tracing::debug;

/// A shard's CRDT guarded by a synchronous lock.
///
/// The lock is never held across an `.await`; callers copy deltas out and
/// release it before doing any I/O.
#[derive(Debug)]
pub struct Shard<C> {
    id: ShardId,
    state: Mutex<C>,
}

impl<C: DeltaCrdt> Shard<C> {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            state: Mutex::new(C::default()),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.state.lock())
    }

    /// Run a local mutation and return what it emitted.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn timestamp(&self) -> C::Timestamp {
        self.state.lock().timestamp()
    }

    pub fn merge_all(&self, deltas: Vec<C::Delta>) -> MergeResult {
        let count = deltas.len();
        let result = self.state.lock().merge_all(deltas);
        debug!(shard = self.id, deltas = count, updated = result.is_updated(), "merged deltas");
        result
    }

    /// At most `max` deltas the cursor has not seen; advances the cursor.
    pub fn next_batch(&self, cursor: &mut C::Timestamp, max: usize) -> Vec<C::Delta> {
        next_batch(&*self.state.lock(), cursor, max)
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size_estimate()
    }

    /// Batches of deltas newer than `since`, ending with the first empty batch.
    ///
    /// The lock is taken per batch, so writers interleave with a long stream.
    /// Deltas merged after the stream started may or may not be included.
    pub fn delta_stream(
        self: Arc<Self>,
        since: C::Timestamp,
        max: usize,
    ) -> BoxStream<'static, Vec<C::Delta>> {
        Box::pin(stream! {
            let mut cursor = since;
            loop {
                let batch = self.next_batch(&mut cursor, max);
                if batch.is_empty() {
                    break;
                }
                yield batch;
            }
        })
    }
}

impl<C: Operable> Shard<C> {
    /// Apply an operation under the local actor's identity.
    pub fn apply(&self, actor: &str, op: C::Operation) -> (C::Output, Vec<C::Delta>) {
        self.state.lock().apply(&actor.to_string(), op)
    }
}
