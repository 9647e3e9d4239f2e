//! Observed-Remove Map
//!
//! Key presence follows OR-Set rules: every mutation of a key mints a key dot
//! and a remove tombstones only the key dots it observed. Each key owns an
//! embedded delta CRDT whose deltas travel tagged with the key.
//!
//! Conflict policy:
//! - A mutation concurrent with a remove survives it, since the remover never
//!   saw the mutation's key dot.
//! - A remove hides the key but keeps its embedded value. A later mutation
//!   resurfaces the key with every inner delta merged so far, on every replica
//!   alike.

use crate::causal::{ActorId, CausalContext, Dot};
use crate::delta::{CausalTimestamp, DeltaCrdt, Element, MergeResult, Operable};
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
struct MapEntry<V> {
    /// Live key dots; empty means hidden
    dots: BTreeSet<Dot>,
    value: V,
}

impl<V: Default> Default for MapEntry<V> {
    fn default() -> Self {
        Self {
            dots: BTreeSet::new(),
            value: V::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrMap<K: Ord, V> {
    entries: BTreeMap<K, MapEntry<V>>,
    /// Remove dot -> (key, tombstoned key dots)
    removals: BTreeMap<Dot, (K, BTreeSet<Dot>)>,
    context: CausalContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrMapDelta<K, D> {
    Add {
        key: K,
        dot: Dot,
    },
    Value {
        key: K,
        delta: D,
    },
    Remove {
        key: K,
        dot: Dot,
        tombstones: BTreeSet<Dot>,
    },
}

impl<K, D> OrMapDelta<K, D> {
    pub fn key(&self) -> &K {
        match self {
            OrMapDelta::Add { key, .. }
            | OrMapDelta::Value { key, .. }
            | OrMapDelta::Remove { key, .. } => key,
        }
    }
}

/// Field-wise timestamp: key presence plus one timestamp per embedded value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, T: Serialize",
    deserialize = "K: Deserialize<'de> + Ord, T: Deserialize<'de>"
))]
pub struct MapTimestamp<K: Ord, T> {
    pub keys: CausalContext,
    #[serde(with = "crate::serde_pairs")]
    pub values: BTreeMap<K, T>,
}

impl<K: Ord, T> Default for MapTimestamp<K, T> {
    fn default() -> Self {
        Self {
            keys: CausalContext::new(),
            values: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, T: Lattice> Lattice for MapTimestamp<K, T> {
    fn bottom() -> Self {
        Self {
            keys: CausalContext::new(),
            values: BTreeMap::new(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.keys.merge(&other.keys);
        for (key, ts) in &other.values {
            joined
                .values
                .entry(key.clone())
                .and_modify(|mine| mine.join_assign(ts))
                .or_insert_with(|| ts.clone());
        }
        joined
    }
}

impl<K, D, T> CausalTimestamp<OrMapDelta<K, D>> for MapTimestamp<K, T>
where
    K: Element,
    T: CausalTimestamp<D>,
{
    fn reflects(&self, delta: &OrMapDelta<K, D>) -> bool {
        match delta {
            OrMapDelta::Add { dot, .. } | OrMapDelta::Remove { dot, .. } => self.keys.contains(dot),
            OrMapDelta::Value { key, delta } => self
                .values
                .get(key)
                .is_some_and(|ts| ts.reflects(delta)),
        }
    }

    fn observe(&mut self, delta: &OrMapDelta<K, D>) {
        match delta {
            OrMapDelta::Add { dot, .. } => {
                self.keys.insert(dot.clone());
            }
            OrMapDelta::Remove {
                dot, tombstones, ..
            } => {
                self.keys.insert(dot.clone());
                for tombstone in tombstones {
                    self.keys.insert(tombstone.clone());
                }
            }
            OrMapDelta::Value { key, delta } => {
                self.values.entry(key.clone()).or_default().observe(delta);
            }
        }
    }
}

impl<K: Ord + Clone, V: DeltaCrdt> OrMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            removals: BTreeMap::new(),
            context: CausalContext::new(),
        }
    }

    /// Mutate the value under `key`, creating it if needed.
    ///
    /// The mutator returns its own output and the inner deltas it produced.
    /// The key dot is minted even when the mutator emits nothing, so the
    /// mutation still revives a concurrently removed key.
    pub fn try_mutate<R, F>(&mut self, actor: &str, key: K, mutator: F) -> (R, Vec<OrMapDelta<K, V::Delta>>)
    where
        F: FnOnce(&mut V) -> (R, Vec<V::Delta>),
    {
        let dot = self.context.next_dot(actor);
        self.context.insert(dot.clone());

        let entry = self.entries.entry(key.clone()).or_default();
        entry.dots.insert(dot.clone());
        let (output, inner) = mutator(&mut entry.value);

        let mut deltas = Vec::with_capacity(inner.len() + 1);
        deltas.push(OrMapDelta::Add {
            key: key.clone(),
            dot,
        });
        deltas.extend(inner.into_iter().map(|delta| OrMapDelta::Value {
            key: key.clone(),
            delta,
        }));
        (output, deltas)
    }

    /// Hide `key`, tombstoning every key dot observed locally.
    pub fn remove(&mut self, actor: &str, key: &K) -> Option<OrMapDelta<K, V::Delta>> {
        let entry = self.entries.get_mut(key)?;
        if entry.dots.is_empty() {
            return None;
        }
        let tombstones = std::mem::take(&mut entry.dots);
        let dot = self.context.next_dot(actor);
        self.context.insert(dot.clone());
        self.removals
            .insert(dot.clone(), (key.clone(), tombstones.clone()));
        Some(OrMapDelta::Remove {
            key: key.clone(),
            dot,
            tombstones,
        })
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| !entry.dots.is_empty())
            .map(|entry| &entry.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Present keys with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.dots.is_empty())
            .map(|(key, entry)| (key, &entry.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone, V: DeltaCrdt> Default for OrMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Element, V: DeltaCrdt> DeltaCrdt for OrMap<K, V> {
    type Delta = OrMapDelta<K, V::Delta>;
    type Timestamp = MapTimestamp<K, V::Timestamp>;

    fn timestamp(&self) -> Self::Timestamp {
        MapTimestamp {
            keys: self.context.clone(),
            values: self
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.value.timestamp()))
                .collect(),
        }
    }

    fn deltas_since<'a>(
        &'a self,
        since: Option<&'a Self::Timestamp>,
    ) -> Box<dyn Iterator<Item = Self::Delta> + 'a> {
        let unseen = move |dot: &Dot| since.map_or(true, |ts| !ts.keys.contains(dot));

        let removes = self
            .removals
            .iter()
            .filter(move |(dot, _)| unseen(dot))
            .map(|(dot, (key, tombstones))| OrMapDelta::Remove {
                key: key.clone(),
                dot: dot.clone(),
                tombstones: tombstones.clone(),
            });
        let adds = self
            .entries
            .iter()
            .flat_map(|(key, entry)| entry.dots.iter().map(move |dot| (key, dot)))
            .filter(move |(_, dot)| unseen(dot))
            .map(|(key, dot)| OrMapDelta::Add {
                key: key.clone(),
                dot: dot.clone(),
            });
        let values = self.entries.iter().flat_map(move |(key, entry)| {
            let peer = since.and_then(|ts| ts.values.get(key));
            entry
                .value
                .deltas_since(peer)
                .map(move |delta| OrMapDelta::Value {
                    key: key.clone(),
                    delta,
                })
        });

        Box::new(removes.chain(adds).chain(values))
    }

    fn merge(&mut self, delta: Self::Delta) -> MergeResult {
        match delta {
            OrMapDelta::Add { key, dot } => {
                if !self.context.insert(dot.clone()) {
                    return MergeResult::StateNotChanged;
                }
                self.entries.entry(key).or_default().dots.insert(dot);
                MergeResult::StateUpdated
            }
            OrMapDelta::Remove {
                key,
                dot,
                tombstones,
            } => {
                if !self.context.insert(dot.clone()) {
                    return MergeResult::StateNotChanged;
                }
                for tombstone in &tombstones {
                    self.context.insert(tombstone.clone());
                }
                // keep the (hidden) entry even when its adds have not arrived
                // yet, so delivery order never changes which keys are tracked
                let entry = self.entries.entry(key.clone()).or_default();
                entry.dots.retain(|live| !tombstones.contains(live));
                self.removals.insert(dot, (key, tombstones));
                MergeResult::StateUpdated
            }
            // a value for an unknown key lands hidden until its key dot arrives
            OrMapDelta::Value { key, delta } => {
                self.entries.entry(key).or_default().value.merge(delta)
            }
        }
    }

    fn size_estimate(&self) -> u64 {
        let values: u64 = self
            .entries
            .values()
            .map(|entry| entry.value.size_estimate() + entry.dots.len() as u64)
            .sum();
        values + self.removals.len() as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrMapOperation<K, O> {
    Mutate { key: K, op: O },
    Remove { key: K },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrMapOutput<O> {
    Mutated(O),
    /// `true` when the key was present.
    Removed(bool),
}

impl<K: Element, V: Operable> Operable for OrMap<K, V> {
    type Operation = OrMapOperation<K, V::Operation>;
    type Output = OrMapOutput<V::Output>;
    type Key = K;

    fn operation_key(op: &Self::Operation) -> &K {
        match op {
            OrMapOperation::Mutate { key, .. } | OrMapOperation::Remove { key } => key,
        }
    }

    fn apply(&mut self, actor: &ActorId, op: Self::Operation) -> (Self::Output, Vec<Self::Delta>) {
        match op {
            OrMapOperation::Mutate { key, op } => {
                let (output, deltas) = self.try_mutate(actor, key, |value| value.apply(actor, op));
                (OrMapOutput::Mutated(output), deltas)
            }
            OrMapOperation::Remove { key } => match self.remove(actor, &key) {
                Some(delta) => (OrMapOutput::Removed(true), vec![delta]),
                None => (OrMapOutput::Removed(false), Vec::new()),
            },
        }
    }
}
