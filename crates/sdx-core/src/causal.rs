//! Dots and causal contexts.
//!
//! Every mutation is identified by a dot `(actor, counter)`. A causal context
//! records which dots a replica has already merged. It keeps a contiguous
//! frontier per actor (every counter `1..=n` seen) plus a "cloud" of dots
//! that arrived out of order, so gaps left by lost messages stay visible to
//! anti-entropy instead of being hidden behind a max counter.

use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identity of the replica that minted a dot.
pub type ActorId = String;

/// A unique identifier for a single mutation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    pub actor: ActorId,
    pub counter: u64,
}

impl Dot {
    pub fn new(actor: impl Into<ActorId>, counter: u64) -> Self {
        Self {
            actor: actor.into(),
            counter,
        }
    }
}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor, self.counter)
    }
}

/// Summary of every dot a replica has merged.
///
/// The representation is canonical: no cloud dot is covered by the frontier
/// and no cloud dot directly extends it. Two contexts holding the same dots
/// therefore compare equal regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalContext {
    frontier: BTreeMap<ActorId, u64>,
    cloud: BTreeSet<Dot>,
}

impl CausalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, dot: &Dot) -> bool {
        dot.counter <= self.frontier_of(&dot.actor) || self.cloud.contains(dot)
    }

    /// Highest contiguous counter seen from `actor`.
    pub fn frontier_of(&self, actor: &str) -> u64 {
        self.frontier.get(actor).copied().unwrap_or(0)
    }

    /// Record a dot. Returns `false` if it was already known.
    pub fn insert(&mut self, dot: Dot) -> bool {
        if self.contains(&dot) {
            return false;
        }
        let current = self.frontier_of(&dot.actor);
        if dot.counter == current + 1 {
            let actor = dot.actor;
            self.frontier.insert(actor.clone(), dot.counter);
            self.compact(&actor);
        } else {
            self.cloud.insert(dot);
        }
        true
    }

    /// The dot `actor` should use for its next mutation.
    ///
    /// Does not record the dot; callers insert it once the mutation applies.
    pub fn next_dot(&self, actor: &str) -> Dot {
        let in_cloud = self
            .cloud
            .range(Dot::new(actor, 0)..=Dot::new(actor, u64::MAX))
            .next_back()
            .map(|dot| dot.counter)
            .unwrap_or(0);
        let counter = self.frontier_of(actor).max(in_cloud) + 1;
        Dot::new(actor, counter)
    }

    /// Join another context into this one.
    pub fn merge(&mut self, other: &CausalContext) {
        for (actor, &counter) in &other.frontier {
            let entry = self.frontier.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        self.cloud.extend(other.cloud.iter().cloned());

        let actors: Vec<ActorId> = self
            .frontier
            .keys()
            .chain(self.cloud.iter().map(|dot| &dot.actor))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for actor in actors {
            self.compact(&actor);
        }
    }

    /// Number of distinct dots recorded.
    pub fn dot_count(&self) -> u64 {
        self.frontier.values().sum::<u64>() + self.cloud.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.frontier.is_empty() && self.cloud.is_empty()
    }

    /// Dots above the frontier, i.e. the gaps this replica is still missing.
    pub fn cloud(&self) -> impl Iterator<Item = &Dot> {
        self.cloud.iter()
    }

    fn compact(&mut self, actor: &str) {
        let mut counter = self.frontier_of(actor);
        // drop cloud entries the frontier already covers
        let covered: Vec<Dot> = self
            .cloud
            .range(Dot::new(actor, 0)..=Dot::new(actor, counter))
            .cloned()
            .collect();
        for dot in covered {
            self.cloud.remove(&dot);
        }
        while self.cloud.remove(&Dot::new(actor, counter + 1)) {
            counter += 1;
        }
        if counter > 0 {
            self.frontier.insert(actor.to_string(), counter);
        }
    }
}

impl Lattice for CausalContext {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.merge(other);
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_dots_extend_frontier() {
        let mut ctx = CausalContext::new();
        assert!(ctx.insert(Dot::new("a", 1)));
        assert!(ctx.insert(Dot::new("a", 2)));
        assert_eq!(ctx.frontier_of("a"), 2);
        assert_eq!(ctx.cloud().count(), 0);
    }

    #[test]
    fn test_gap_stays_visible_until_filled() {
        let mut ctx = CausalContext::new();
        ctx.insert(Dot::new("a", 1));
        ctx.insert(Dot::new("a", 3));

        assert!(!ctx.contains(&Dot::new("a", 2)));
        assert!(ctx.contains(&Dot::new("a", 3)));
        assert_eq!(ctx.frontier_of("a"), 1);

        ctx.insert(Dot::new("a", 2));
        assert_eq!(ctx.frontier_of("a"), 3);
        assert_eq!(ctx.cloud().count(), 0);
    }

    #[test]
    fn test_duplicate_insert_reports_known() {
        let mut ctx = CausalContext::new();
        assert!(ctx.insert(Dot::new("a", 1)));
        assert!(!ctx.insert(Dot::new("a", 1)));
    }

    #[test]
    fn test_next_dot_skips_cloud() {
        let mut ctx = CausalContext::new();
        ctx.insert(Dot::new("a", 1));
        ctx.insert(Dot::new("a", 5));
        assert_eq!(ctx.next_dot("a"), Dot::new("a", 6));
        assert_eq!(ctx.next_dot("b"), Dot::new("b", 1));
    }

    #[test]
    fn test_merge_is_canonical() {
        let mut left = CausalContext::new();
        left.insert(Dot::new("a", 1));
        left.insert(Dot::new("a", 3));

        let mut right = CausalContext::new();
        right.insert(Dot::new("a", 2));
        right.insert(Dot::new("b", 2));

        let joined = left.join(&right);

        let mut direct = CausalContext::new();
        for dot in [
            Dot::new("b", 2),
            Dot::new("a", 3),
            Dot::new("a", 2),
            Dot::new("a", 1),
        ] {
            direct.insert(dot);
        }

        assert_eq!(joined, direct);
        assert_eq!(joined, right.join(&left));
        assert_eq!(joined.frontier_of("a"), 3);
        assert_eq!(joined.dot_count(), 4);
    }

    #[test]
    fn test_leq_reflects_dominance() {
        let mut small = CausalContext::new();
        small.insert(Dot::new("a", 1));
        let mut big = small.clone();
        big.insert(Dot::new("b", 1));

        assert!(small.leq(&big));
        assert!(!big.leq(&small));
    }
}
