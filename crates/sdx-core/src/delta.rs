//! The delta-state contract shared by every CRDT family.
//!
//! A CRDT exposes its causal timestamp, enumerates the deltas a peer with a
//! given timestamp has not yet merged, and merges incoming deltas. Deltas are
//! closed enums, one per family; merging is commutative, associative and
//! idempotent, so deltas may be re-applied in any order any number of times.

use crate::causal::ActorId;
use crate::lattice::Lattice;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Whether merging changed the replica. Drives further fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResult {
    StateUpdated,
    StateNotChanged,
}

impl MergeResult {
    pub fn is_updated(self) -> bool {
        matches!(self, MergeResult::StateUpdated)
    }

    /// `StateUpdated` if either side updated.
    pub fn or(self, other: MergeResult) -> MergeResult {
        if self.is_updated() || other.is_updated() {
            MergeResult::StateUpdated
        } else {
            MergeResult::StateNotChanged
        }
    }
}

/// Bounds for anything stored in or keyed into a CRDT.
pub trait Element:
    Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Element for T where
    T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A causal timestamp for deltas of type `D`.
pub trait CausalTimestamp<D>:
    Lattice + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Is `delta` already merged into a replica carrying this timestamp?
    fn reflects(&self, delta: &D) -> bool;

    /// Advance the timestamp as if `delta` had been merged.
    fn observe(&mut self, delta: &D);
}

/// A delta-state CRDT.
pub trait DeltaCrdt: Default + Send + Sync + 'static {
    type Delta: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Timestamp: CausalTimestamp<Self::Delta>;

    /// Everything merged so far.
    fn timestamp(&self) -> Self::Timestamp;

    /// Deltas not reflected in `since`, or the full history when `None`.
    ///
    /// The sequence is lazy and finite. Calling again with a timestamp that
    /// observed part of a previous run resumes where it stopped.
    fn deltas_since<'a>(
        &'a self,
        since: Option<&'a Self::Timestamp>,
    ) -> Box<dyn Iterator<Item = Self::Delta> + 'a>;

    fn merge(&mut self, delta: Self::Delta) -> MergeResult;

    fn merge_all<I>(&mut self, deltas: I) -> MergeResult
    where
        I: IntoIterator<Item = Self::Delta>,
        Self: Sized,
    {
        deltas
            .into_iter()
            .fold(MergeResult::StateNotChanged, |acc, delta| {
                acc.or(self.merge(delta))
            })
    }

    /// Rough storage footprint, used to balance replica placement.
    fn size_estimate(&self) -> u64;
}

/// A CRDT that can be driven by serializable operations.
///
/// Operations carry no actor: the replica applying the operation mints dots
/// under its own identity, so a forwarded operation never reuses another
/// replica's counters.
pub trait Operable: DeltaCrdt {
    type Operation: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// The part of an operation that selects its shard.
    type Key: Serialize;

    fn operation_key(op: &Self::Operation) -> &Self::Key;

    fn apply(&mut self, actor: &ActorId, op: Self::Operation) -> (Self::Output, Vec<Self::Delta>);
}

/// Take at most `max` deltas the cursor has not seen and advance it past them.
///
/// Repeated calls walk the backlog in bounded chunks and end with an empty
/// batch. A cursor starting at the default timestamp walks the full history.
pub fn next_batch<C: DeltaCrdt>(crdt: &C, cursor: &mut C::Timestamp, max: usize) -> Vec<C::Delta> {
    let batch: Vec<C::Delta> = crdt.deltas_since(Some(&*cursor)).take(max.max(1)).collect();
    for delta in &batch {
        cursor.observe(delta);
    }
    batch
}
