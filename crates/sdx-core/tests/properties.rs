//! Property-based tests that MUST pass for every CRDT family
//!
//! Deltas produced by arbitrary interleavings of operations on several
//! replicas must converge regardless of delivery order and duplication:
//!  - Merging a shuffled, duplicated multiset equals merging in generation order
//!  - Re-merging any delta reports `StateNotChanged`
//!  - A peer holding timestamp T receives nothing newer than T

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sdx_core::causal::{CausalContext, Dot};
use sdx_core::delta::{next_batch, CausalTimestamp, DeltaCrdt, MergeResult};
use sdx_core::lattice::Lattice;
use sdx_core::lwwreg::LwwRegistry;
use sdx_core::ormap::OrMap;
use sdx_core::orset::OrSet;

const ACTORS: [&str; 3] = ["replica0", "replica1", "replica2"];

/// (acting replica, element, is_add, sync_from)
type Step = (usize, u8, bool, Option<usize>);

fn steps_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (0usize..3, 0u8..4, any::<bool>(), prop::option::weighted(0.2, 0usize..3)),
        1..40,
    )
}

/// Drive three replicas with `step`, syncing replicas when asked, and collect
/// every delta in generation order.
fn generate<C, F>(steps: &[Step], mut step: F) -> Vec<C::Delta>
where
    C: DeltaCrdt + Clone,
    F: FnMut(&mut C, &str, u8, bool) -> Vec<C::Delta>,
{
    let mut replicas: Vec<C> = (0..ACTORS.len()).map(|_| C::default()).collect();
    let mut produced = Vec::new();

    for &(actor, element, is_add, sync_from) in steps {
        if let Some(from) = sync_from {
            let source = replicas[from].clone();
            let since = replicas[actor].timestamp();
            let missing: Vec<_> = source.deltas_since(Some(&since)).collect();
            replicas[actor].merge_all(missing);
        }
        produced.extend(step(&mut replicas[actor], ACTORS[actor], element, is_add));
    }
    produced
}

fn shuffled_with_duplicates<D: Clone>(deltas: &[D], seed: u64) -> Vec<D> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out: Vec<D> = deltas.to_vec();
    for delta in deltas {
        if rng.gen_bool(0.3) {
            out.push(delta.clone());
        }
    }
    out.shuffle(&mut rng);
    out
}

fn orset_step(set: &mut OrSet<u8>, actor: &str, item: u8, is_add: bool) -> Vec<sdx_core::OrSetDelta<u8>> {
    if is_add {
        vec![set.add(actor, item)]
    } else {
        set.remove(actor, &item).into_iter().collect()
    }
}

fn lww_step(
    reg: &mut LwwRegistry<u8, u8>,
    actor: &str,
    key: u8,
    is_add: bool,
) -> Vec<sdx_core::LwwDelta<u8, u8>> {
    // times collide often so the actor tie-break is exercised
    let time = reg.stamp(&key).map_or(1, |stamp| stamp.time + u64::from(key % 2));
    let result = if is_add {
        reg.try_set(actor, key, key.wrapping_mul(7), time)
    } else {
        reg.try_remove(actor, key, time)
    };
    result.into_iter().collect()
}

type TagMap = OrMap<u8, OrSet<u8>>;

fn ormap_step(
    map: &mut TagMap,
    actor: &str,
    key: u8,
    is_add: bool,
) -> Vec<<TagMap as DeltaCrdt>::Delta> {
    if is_add {
        map.try_mutate(actor, key % 2, |set| ((), vec![set.add(actor, key)]))
            .1
    } else {
        map.remove(actor, &(key % 2)).into_iter().collect()
    }
}

fn assert_converges<C>(deltas: Vec<C::Delta>, seed: u64) -> Result<(), TestCaseError>
where
    C: DeltaCrdt + PartialEq + std::fmt::Debug,
{
    let mut ordered = C::default();
    ordered.merge_all(deltas.clone());

    let mut scrambled = C::default();
    scrambled.merge_all(shuffled_with_duplicates(&deltas, seed));

    prop_assert_eq!(&scrambled, &ordered);
    prop_assert_eq!(scrambled.timestamp(), ordered.timestamp());
    Ok(())
}

// ============================================================================
// Convergence
// ============================================================================

proptest! {
    #[test]
    fn orset_converges_under_any_delivery(steps in steps_strategy(), seed in any::<u64>()) {
        let deltas = generate::<OrSet<u8>, _>(&steps, orset_step);
        assert_converges::<OrSet<u8>>(deltas, seed)?;
    }

    #[test]
    fn lwwreg_converges_under_any_delivery(steps in steps_strategy(), seed in any::<u64>()) {
        let deltas = generate::<LwwRegistry<u8, u8>, _>(&steps, lww_step);
        assert_converges::<LwwRegistry<u8, u8>>(deltas, seed)?;
    }

    #[test]
    fn ormap_converges_under_any_delivery(steps in steps_strategy(), seed in any::<u64>()) {
        let deltas = generate::<TagMap, _>(&steps, ormap_step);
        assert_converges::<TagMap>(deltas, seed)?;
    }
}

// ============================================================================
// Idempotence and minimality
// ============================================================================

proptest! {
    #[test]
    fn orset_remerge_is_noop(steps in steps_strategy()) {
        let deltas = generate::<OrSet<u8>, _>(&steps, orset_step);
        let mut set = OrSet::default();
        set.merge_all(deltas.clone());
        let snapshot = set.clone();

        for delta in deltas {
            prop_assert_eq!(set.merge(delta), MergeResult::StateNotChanged);
        }
        prop_assert_eq!(set, snapshot);
    }

    #[test]
    fn caught_up_peer_receives_nothing(steps in steps_strategy()) {
        let deltas = generate::<TagMap, _>(&steps, ormap_step);
        let mut map = TagMap::default();
        map.merge_all(deltas);

        let peer_ts = map.timestamp();
        prop_assert_eq!(map.deltas_since(Some(&peer_ts)).count(), 0);
    }

    #[test]
    fn batched_enumeration_rebuilds_state(steps in steps_strategy(), max in 1usize..5) {
        let deltas = generate::<OrSet<u8>, _>(&steps, orset_step);
        let mut source = OrSet::default();
        source.merge_all(deltas);

        let mut cursor = CausalContext::default();
        let mut target = OrSet::default();
        loop {
            let batch = next_batch(&source, &mut cursor, max);
            if batch.is_empty() {
                break;
            }
            prop_assert!(batch.len() <= max);
            target.merge_all(batch);
        }
        prop_assert_eq!(target, source);
    }

    #[test]
    fn newer_deltas_are_not_reflected(steps in steps_strategy(), cut in 0usize..40) {
        let deltas = generate::<LwwRegistry<u8, u8>, _>(&steps, lww_step);
        let cut = cut.min(deltas.len());

        let mut peer = LwwRegistry::default();
        peer.merge_all(deltas[..cut].to_vec());
        let mut full = peer.clone();
        full.merge_all(deltas[cut..].to_vec());

        let peer_ts = peer.timestamp();
        for delta in full.deltas_since(Some(&peer_ts)) {
            prop_assert!(!peer_ts.reflects(&delta));
        }
    }
}

// ============================================================================
// Causal context lattice laws
// ============================================================================

fn context_strategy() -> impl Strategy<Value = CausalContext> {
    prop::collection::vec((0usize..3, 1u64..8), 0..12).prop_map(|dots| {
        let mut ctx = CausalContext::new();
        for (actor, counter) in dots {
            ctx.insert(Dot::new(ACTORS[actor], counter));
        }
        ctx
    })
}

proptest! {
    #[test]
    fn context_join_is_commutative(a in context_strategy(), b in context_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn context_join_is_associative(
        a in context_strategy(),
        b in context_strategy(),
        c in context_strategy()
    ) {
        let left = a.join(&b).join(&c);
        let right = a.join(&b.join(&c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn context_join_is_idempotent(a in context_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn context_bottom_is_identity(a in context_strategy()) {
        let bottom = CausalContext::bottom();
        prop_assert_eq!(a.join(&bottom), a.clone());
        prop_assert_eq!(bottom.join(&a), a);
    }
}
