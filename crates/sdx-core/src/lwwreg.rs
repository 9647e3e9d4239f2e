//! Last-Writer-Wins Registry
//!
//! A keyed registry where each key holds the value (or tombstone) carrying the
//! greatest stamp seen. Stamps order by time first and by actor on ties, so
//! every replica picks the same winner whatever the arrival order.

use crate::causal::ActorId;
use crate::delta::{CausalTimestamp, DeltaCrdt, Element, MergeResult, Operable};
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Write stamp. Field order matters: derived `Ord` compares `time` then `actor`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LwwStamp {
    pub time: u64,
    pub actor: ActorId,
}

impl LwwStamp {
    pub fn new(time: u64, actor: impl Into<ActorId>) -> Self {
        Self {
            time,
            actor: actor.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LwwEntry<V> {
    /// `None` is a tombstone
    value: Option<V>,
    stamp: LwwStamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LwwDelta<K, V> {
    Set { key: K, value: V, stamp: LwwStamp },
    Remove { key: K, stamp: LwwStamp },
}

impl<K, V> LwwDelta<K, V> {
    pub fn key(&self) -> &K {
        match self {
            LwwDelta::Set { key, .. } | LwwDelta::Remove { key, .. } => key,
        }
    }

    pub fn stamp(&self) -> &LwwStamp {
        match self {
            LwwDelta::Set { stamp, .. } | LwwDelta::Remove { stamp, .. } => stamp,
        }
    }
}

/// A rejected local write: the current winner stays in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwConflict<V> {
    /// `None` when the winner is a tombstone
    pub winner: Option<V>,
    pub stamp: LwwStamp,
}

/// Highest stamp merged per key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize",
    deserialize = "K: Deserialize<'de> + Ord"
))]
pub struct LwwTimestamp<K: Ord> {
    #[serde(with = "crate::serde_pairs")]
    stamps: BTreeMap<K, LwwStamp>,
}

impl<K: Ord + Clone> LwwTimestamp<K> {
    pub fn new() -> Self {
        Self {
            stamps: BTreeMap::new(),
        }
    }

    pub fn stamp_of(&self, key: &K) -> Option<&LwwStamp> {
        self.stamps.get(key)
    }

    fn advance(&mut self, key: &K, stamp: &LwwStamp) {
        match self.stamps.get_mut(key) {
            Some(current) if *current >= *stamp => {}
            Some(current) => *current = stamp.clone(),
            None => {
                self.stamps.insert(key.clone(), stamp.clone());
            }
        }
    }
}

impl<K: Ord + Clone> Default for LwwTimestamp<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> Lattice for LwwTimestamp<K> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        for (key, stamp) in &other.stamps {
            joined.advance(key, stamp);
        }
        joined
    }
}

impl<K: Element, V> CausalTimestamp<LwwDelta<K, V>> for LwwTimestamp<K> {
    fn reflects(&self, delta: &LwwDelta<K, V>) -> bool {
        self.stamps
            .get(delta.key())
            .is_some_and(|seen| seen >= delta.stamp())
    }

    fn observe(&mut self, delta: &LwwDelta<K, V>) {
        self.advance(delta.key(), delta.stamp());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LwwRegistry<K: Ord, V> {
    entries: BTreeMap<K, LwwEntry<V>>,
}

impl<K: Ord + Clone, V: Clone> LwwRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Set `key` to `value` if `(time, actor)` beats the stored stamp.
    pub fn try_set(
        &mut self,
        actor: &str,
        key: K,
        value: V,
        time: u64,
    ) -> Result<LwwDelta<K, V>, LwwConflict<V>> {
        let stamp = LwwStamp::new(time, actor);
        self.check(&key, &stamp)?;
        self.entries.insert(
            key.clone(),
            LwwEntry {
                value: Some(value.clone()),
                stamp: stamp.clone(),
            },
        );
        Ok(LwwDelta::Set { key, value, stamp })
    }

    /// Tombstone `key` under the same comparison rule as [`Self::try_set`].
    pub fn try_remove(
        &mut self,
        actor: &str,
        key: K,
        time: u64,
    ) -> Result<LwwDelta<K, V>, LwwConflict<V>> {
        let stamp = LwwStamp::new(time, actor);
        self.check(&key, &stamp)?;
        self.entries.insert(
            key.clone(),
            LwwEntry {
                value: None,
                stamp: stamp.clone(),
            },
        );
        Ok(LwwDelta::Remove { key, stamp })
    }

    fn check(&self, key: &K, stamp: &LwwStamp) -> Result<(), LwwConflict<V>> {
        match self.entries.get(key) {
            Some(current) if current.stamp >= *stamp => Err(LwwConflict {
                winner: current.value.clone(),
                stamp: current.stamp.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(|entry| entry.value.as_ref())
    }

    /// Stamp of the current winner, tombstones included.
    pub fn stamp(&self, key: &K) -> Option<&LwwStamp> {
        self.entries.get(key).map(|entry| &entry.stamp)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Live (non-tombstoned) entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.value.as_ref().map(|value| (key, value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone, V: Clone> Default for LwwRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Element, V: Element> DeltaCrdt for LwwRegistry<K, V> {
    type Delta = LwwDelta<K, V>;
    type Timestamp = LwwTimestamp<K>;

    fn timestamp(&self) -> LwwTimestamp<K> {
        LwwTimestamp {
            stamps: self
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.stamp.clone()))
                .collect(),
        }
    }

    fn deltas_since<'a>(
        &'a self,
        since: Option<&'a LwwTimestamp<K>>,
    ) -> Box<dyn Iterator<Item = LwwDelta<K, V>> + 'a> {
        Box::new(
            self.entries
                .iter()
                .filter(move |(key, entry)| {
                    since
                        .and_then(|ts| ts.stamp_of(key))
                        .map_or(true, |seen| *seen < entry.stamp)
                })
                .map(|(key, entry)| match &entry.value {
                    Some(value) => LwwDelta::Set {
                        key: key.clone(),
                        value: value.clone(),
                        stamp: entry.stamp.clone(),
                    },
                    None => LwwDelta::Remove {
                        key: key.clone(),
                        stamp: entry.stamp.clone(),
                    },
                }),
        )
    }

    fn merge(&mut self, delta: LwwDelta<K, V>) -> MergeResult {
        let (key, value, stamp) = match delta {
            LwwDelta::Set { key, value, stamp } => (key, Some(value), stamp),
            LwwDelta::Remove { key, stamp } => (key, None, stamp),
        };
        if let Some(current) = self.entries.get(&key) {
            if current.stamp >= stamp {
                return MergeResult::StateNotChanged;
            }
        }
        self.entries.insert(key, LwwEntry { value, stamp });
        MergeResult::StateUpdated
    }

    fn size_estimate(&self) -> u64 {
        self.entries.len() as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LwwOperation<K, V> {
    Set { key: K, value: V, time: u64 },
    Remove { key: K, time: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LwwOutcome<V> {
    Applied,
    Conflict { winner: Option<V>, stamp: LwwStamp },
}

impl<V> From<LwwConflict<V>> for LwwOutcome<V> {
    fn from(conflict: LwwConflict<V>) -> Self {
        LwwOutcome::Conflict {
            winner: conflict.winner,
            stamp: conflict.stamp,
        }
    }
}

impl<K: Element, V: Element> Operable for LwwRegistry<K, V> {
    type Operation = LwwOperation<K, V>;
    type Output = LwwOutcome<V>;
    type Key = K;

    fn operation_key(op: &LwwOperation<K, V>) -> &K {
        match op {
            LwwOperation::Set { key, .. } | LwwOperation::Remove { key, .. } => key,
        }
    }

    fn apply(
        &mut self,
        actor: &ActorId,
        op: LwwOperation<K, V>,
    ) -> (LwwOutcome<V>, Vec<LwwDelta<K, V>>) {
        let result = match op {
            LwwOperation::Set { key, value, time } => self.try_set(actor, key, value, time),
            LwwOperation::Remove { key, time } => self.try_remove(actor, key, time),
        };
        match result {
            Ok(delta) => (LwwOutcome::Applied, vec![delta]),
            Err(conflict) => (conflict.into(), Vec::new()),
        }
    }
}
