//! Observed-Remove Set (OR-Set / Add-Wins Set)
//!
//! Each add mints a unique dot. Remove tombstones only the dots it observed.
//! Concurrent add and remove of the same element: add wins.

use crate::causal::{ActorId, CausalContext, Dot};
use crate::delta::{CausalTimestamp, DeltaCrdt, Element, MergeResult, Operable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrSet<T: Ord + Clone> {
    /// Maps elements to their live dots
    entries: BTreeMap<T, BTreeSet<Dot>>,
    /// Remove dot -> the dots it tombstoned, kept so peers can catch up
    removals: BTreeMap<Dot, BTreeSet<Dot>>,
    /// Adds, removes and tombstoned dots seen so far
    context: CausalContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrSetDelta<T> {
    Add { dot: Dot, item: T },
    Remove { dot: Dot, tombstones: BTreeSet<Dot> },
}

impl<T> OrSetDelta<T> {
    pub fn dot(&self) -> &Dot {
        match self {
            OrSetDelta::Add { dot, .. } | OrSetDelta::Remove { dot, .. } => dot,
        }
    }
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            removals: BTreeMap::new(),
            context: CausalContext::new(),
        }
    }

    /// Add an element under a fresh dot minted for `actor`
    pub fn add(&mut self, actor: &str, item: T) -> OrSetDelta<T> {
        let dot = self.context.next_dot(actor);
        self.context.insert(dot.clone());
        self.entries
            .entry(item.clone())
            .or_default()
            .insert(dot.clone());
        OrSetDelta::Add { dot, item }
    }

    /// Remove all observed instances of an element.
    ///
    /// Returns `None` when nothing was observed: there is nothing to tombstone.
    pub fn remove(&mut self, actor: &str, item: &T) -> Option<OrSetDelta<T>> {
        let tombstones = self.entries.remove(item).filter(|dots| !dots.is_empty())?;
        let dot = self.context.next_dot(actor);
        self.context.insert(dot.clone());
        self.removals.insert(dot.clone(), tombstones.clone());
        Some(OrSetDelta::Remove { dot, tombstones })
    }

    pub fn contains(&self, item: &T) -> bool {
        self.entries.get(item).is_some_and(|dots| !dots.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn context(&self) -> &CausalContext {
        &self.context
    }
}

impl<T: Ord + Clone> Default for OrSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CausalTimestamp<OrSetDelta<T>> for CausalContext {
    fn reflects(&self, delta: &OrSetDelta<T>) -> bool {
        self.contains(delta.dot())
    }

    fn observe(&mut self, delta: &OrSetDelta<T>) {
        match delta {
            OrSetDelta::Add { dot, .. } => {
                self.insert(dot.clone());
            }
            OrSetDelta::Remove { dot, tombstones } => {
                self.insert(dot.clone());
                for tombstone in tombstones {
                    self.insert(tombstone.clone());
                }
            }
        }
    }
}

impl<T: Element> DeltaCrdt for OrSet<T> {
    type Delta = OrSetDelta<T>;
    type Timestamp = CausalContext;

    fn timestamp(&self) -> CausalContext {
        self.context.clone()
    }

    fn deltas_since<'a>(
        &'a self,
        since: Option<&'a CausalContext>,
    ) -> Box<dyn Iterator<Item = OrSetDelta<T>> + 'a> {
        let unseen = move |dot: &Dot| since.map_or(true, |ctx| !ctx.contains(dot));

        let removes = self
            .removals
            .iter()
            .filter(move |(dot, _)| unseen(dot))
            .map(|(dot, tombstones)| OrSetDelta::Remove {
                dot: dot.clone(),
                tombstones: tombstones.clone(),
            });
        let adds = self
            .entries
            .iter()
            .flat_map(|(item, dots)| dots.iter().map(move |dot| (item, dot)))
            .filter(move |(_, dot)| unseen(dot))
            .map(|(item, dot)| OrSetDelta::Add {
                dot: dot.clone(),
                item: item.clone(),
            });

        Box::new(removes.chain(adds))
    }

    fn merge(&mut self, delta: OrSetDelta<T>) -> MergeResult {
        if self.context.contains(delta.dot()) {
            return MergeResult::StateNotChanged;
        }
        match delta {
            OrSetDelta::Add { dot, item } => {
                self.context.insert(dot.clone());
                self.entries.entry(item).or_default().insert(dot);
            }
            OrSetDelta::Remove { dot, tombstones } => {
                self.context.insert(dot.clone());
                for tombstone in &tombstones {
                    self.context.insert(tombstone.clone());
                }
                for dots in self.entries.values_mut() {
                    dots.retain(|live| !tombstones.contains(live));
                }
                self.entries.retain(|_, dots| !dots.is_empty());
                self.removals.insert(dot, tombstones);
            }
        }
        MergeResult::StateUpdated
    }

    fn size_estimate(&self) -> u64 {
        let live: usize = self.entries.values().map(BTreeSet::len).sum();
        (live + self.removals.len()) as u64
    }
}

/// Operations accepted by a managed OR-Set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OrSetOperation<T> {
    Add { item: T },
    Remove { item: T },
}

impl<T: Element> Operable for OrSet<T> {
    type Operation = OrSetOperation<T>;
    /// `true` when the operation produced a delta.
    type Output = bool;
    type Key = T;

    fn operation_key(op: &OrSetOperation<T>) -> &T {
        match op {
            OrSetOperation::Add { item } | OrSetOperation::Remove { item } => item,
        }
    }

    fn apply(&mut self, actor: &ActorId, op: OrSetOperation<T>) -> (bool, Vec<OrSetDelta<T>>) {
        match op {
            OrSetOperation::Add { item } => (true, vec![self.add(actor, item)]),
            OrSetOperation::Remove { item } => match self.remove(actor, &item) {
                Some(delta) => (true, vec![delta]),
                None => (false, Vec::new()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_remove_same_replica() {
        let mut set = OrSet::new();
        set.add("a", "x".to_string());
        assert!(set.contains(&"x".to_string()));

        let delta = set.remove("a", &"x".to_string());
        assert!(delta.is_some());
        assert!(!set.contains(&"x".to_string()));
    }

    #[test]
    fn test_remove_unobserved_produces_nothing() {
        let mut set: OrSet<String> = OrSet::new();
        assert!(set.remove("a", &"ghost".to_string()).is_none());
        assert!(set.context().is_empty());
    }

    #[test]
    fn test_concurrent_add_wins_over_remove() {
        let mut node1 = OrSet::new();
        let mut node2 = OrSet::new();

        // both start out knowing "x"
        let seed = node1.add("n1", "x".to_string());
        node2.merge(seed);

        // node1 re-adds while node2 removes what it observed
        let readd = node1.add("n1", "x".to_string());
        let removal = node2.remove("n2", &"x".to_string()).unwrap();

        node1.merge(removal);
        node2.merge(readd);

        assert!(node1.contains(&"x".to_string()));
        assert!(node2.contains(&"x".to_string()));
        assert_eq!(node1, node2);
    }

    #[test]
    fn test_concurrent_add_and_remove_on_unaware_node() {
        let mut node1 = OrSet::new();
        let mut node2: OrSet<String> = OrSet::new();

        let add = node1.add("n1", "x".to_string());
        // node2 never saw the add, so its remove has nothing to tombstone
        assert!(node2.remove("n2", &"x".to_string()).is_none());

        node2.merge(add);
        assert!(node2.contains(&"x".to_string()));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut source = OrSet::new();
        let delta = source.add("a", 7);

        let mut target = OrSet::new();
        assert_eq!(target.merge(delta.clone()), MergeResult::StateUpdated);
        let snapshot = target.clone();
        assert_eq!(target.merge(delta), MergeResult::StateNotChanged);
        assert_eq!(target, snapshot);
    }

    #[test]
    fn test_late_add_after_remove_stays_removed() {
        let mut origin = OrSet::new();
        let add = origin.add("a", 1);
        let remove = origin.remove("a", &1).unwrap();

        let mut late = OrSet::new();
        late.merge(remove);
        assert_eq!(late.merge(add), MergeResult::StateNotChanged);
        assert!(!late.contains(&1));
        assert_eq!(late.timestamp(), origin.timestamp());
    }

    #[test]
    fn test_deltas_since_skips_known_dots() {
        let mut set = OrSet::new();
        set.add("a", 1);
        let checkpoint = set.timestamp();
        set.add("a", 2);
        set.remove("a", &1);

        let newer: Vec<_> = set.deltas_since(Some(&checkpoint)).collect();
        assert_eq!(newer.len(), 2);

        let full: Vec<_> = set.deltas_since(None).collect();
        let mut rebuilt = OrSet::new();
        rebuilt.merge_all(full);
        assert_eq!(rebuilt, set);

        let current = set.timestamp();
        assert_eq!(set.deltas_since(Some(&current)).count(), 0);
    }

    #[test]
    fn test_operations_drive_deltas() {
        let mut set = OrSet::new();
        let actor = "a".to_string();
        let (added, deltas) = set.apply(&actor, OrSetOperation::Add { item: 3 });
        assert!(added);
        assert_eq!(deltas.len(), 1);

        let (removed, deltas) = set.apply(&actor, OrSetOperation::Remove { item: 4 });
        assert!(!removed);
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_delta_serialization() {
        let mut set = OrSet::new();
        let add = set.add("a", "x".to_string());
        let remove = set.remove("a", &"x".to_string()).unwrap();

        for delta in [add, remove] {
            let encoded = serde_json::to_string(&delta).unwrap();
            let decoded: OrSetDelta<String> = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, delta);
        }

        let unknown = r#"{"kind":"clear"}"#;
        assert!(serde_json::from_str::<OrSetDelta<String>>(unknown).is_err());
    }
}
