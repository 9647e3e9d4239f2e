//! Convergence tests for timestamp-diff anti-entropy
//!
//! These tests verify that every CRDT family converges under message loss,
//! duplication and reordering, and that anti-entropy only ever resends what a
//! peer is missing.

use proptest::prelude::*;
use sdx_core::delta::DeltaCrdt;
use sdx_core::lwwreg::LwwRegistry;
use sdx_core::ormap::OrMap;
use sdx_core::orset::OrSet;
use sdx_delta::anti_entropy::{AntiEntropyCluster, NetworkConfig};
use sdx_delta::buffer::RetryBuffer;

fn sync_until_converged<C>(cluster: &mut AntiEntropyCluster<C>, max_rounds: usize) -> usize
where
    C: DeltaCrdt + Clone + std::fmt::Debug,
{
    let mut rounds = 0;
    while !cluster.is_converged() && rounds < max_rounds {
        cluster.ring_sync_round();
        rounds += 1;
    }
    rounds
}

// ============================================================================
// OR-Set
// ============================================================================

#[test]
fn test_orset_convergence_perfect_network() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::new(3, NetworkConfig::default());

    for i in 0..3 {
        cluster.mutate(i, |set, actor| vec![set.add(actor, (i as i32 + 1) * 10)]);
    }

    cluster.full_sync_round();
    assert!(cluster.is_converged());
    assert_eq!(cluster.replica(0).state().len(), 3);
}

#[test]
fn test_orset_ring_reaches_everyone() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::new(5, NetworkConfig::default());
    cluster.mutate(0, |set, actor| vec![set.add(actor, 1)]);

    let rounds = sync_until_converged(&mut cluster, 10);
    assert!(cluster.is_converged(), "not converged after {} rounds", rounds);
    assert!(cluster.replica(4).state().contains(&1));
}

#[test]
fn test_orset_convergence_with_loss() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::new(4, NetworkConfig::lossy(0.5));

    for i in 0..4 {
        cluster.mutate(i, |set, actor| vec![set.add(actor, i as i32)]);
    }

    let rounds = sync_until_converged(&mut cluster, 100);
    assert!(cluster.is_converged(), "Failed to converge after {} rounds", rounds);
    assert!(cluster.network().lost_count() > 0);
    assert_eq!(cluster.replica(0).state().len(), 4);
}

#[test]
fn test_orset_concurrent_add_remove_across_replicas() {
    let mut cluster: AntiEntropyCluster<OrSet<String>> =
        AntiEntropyCluster::new(2, NetworkConfig::default());

    cluster.mutate(0, |set, actor| vec![set.add(actor, "x".to_string())]);
    cluster.full_sync_round();

    // replica 0 re-adds while replica 1 removes the copy it observed
    cluster.mutate(0, |set, actor| vec![set.add(actor, "x".to_string())]);
    cluster.mutate(1, |set, actor| set.remove(actor, &"x".to_string()).into_iter().collect());
    cluster.full_sync_round();

    assert!(cluster.is_converged());
    assert!(cluster.replica(1).state().contains(&"x".to_string()));
}

#[test]
fn test_orset_chaotic_network() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::with_batch_size(4, NetworkConfig::chaotic(), 2);

    for i in 0..4 {
        for j in 0..5 {
            let item = (i * 10 + j) as i32;
            cluster.mutate(i, |set, actor| vec![set.add(actor, item)]);
        }
    }
    cluster.mutate(2, |set, actor| set.remove(actor, &20).into_iter().collect());

    let rounds = sync_until_converged(&mut cluster, 200);
    assert!(cluster.is_converged(), "Failed to converge after {} rounds", rounds);
    for i in 0..4 {
        assert_eq!(cluster.replica(i).state().len(), 19, "replica {}", i);
        assert!(!cluster.replica(i).state().contains(&20));
    }
}

// ============================================================================
// LWW Registry
// ============================================================================

#[test]
fn test_lwwreg_highest_stamp_wins_everywhere() {
    let mut cluster: AntiEntropyCluster<LwwRegistry<String, i32>> =
        AntiEntropyCluster::new(3, NetworkConfig::with_dups(0.5));

    cluster.mutate(0, |reg, actor| reg.try_set(actor, "k".into(), 1, 100).into_iter().collect());
    cluster.mutate(1, |reg, actor| reg.try_set(actor, "k".into(), 2, 300).into_iter().collect());
    cluster.mutate(2, |reg, actor| reg.try_set(actor, "k".into(), 3, 200).into_iter().collect());

    sync_until_converged(&mut cluster, 10);
    assert!(cluster.is_converged());
    for i in 0..3 {
        assert_eq!(cluster.replica(i).state().get(&"k".to_string()), Some(&2));
    }
}

#[test]
fn test_lwwreg_equal_time_tie_breaks_by_actor() {
    let mut cluster: AntiEntropyCluster<LwwRegistry<String, i32>> =
        AntiEntropyCluster::new(3, NetworkConfig::default());

    for i in 0..3 {
        cluster.mutate(i, |reg, actor| {
            reg.try_set(actor, "k".into(), i as i32, 100).into_iter().collect()
        });
    }
    cluster.full_sync_round();

    // "replica_2" is the greatest actor at equal time
    for i in 0..3 {
        assert_eq!(cluster.replica(i).state().get(&"k".to_string()), Some(&2));
    }
}

// ============================================================================
// OR-Map
// ============================================================================

#[test]
fn test_ormap_nested_values_converge() {
    type Tags = OrMap<String, OrSet<String>>;
    let mut cluster: AntiEntropyCluster<Tags> =
        AntiEntropyCluster::new(3, NetworkConfig::chaotic().seeded(7));

    for i in 0..3 {
        cluster.mutate(i, |map, actor| {
            map.try_mutate(actor, "tags".to_string(), |set| {
                ((), vec![set.add(actor, format!("t{}", i))])
            })
            .1
        });
    }

    let rounds = sync_until_converged(&mut cluster, 200);
    assert!(cluster.is_converged(), "Failed to converge after {} rounds", rounds);
    let tags = cluster.replica(0).state().get(&"tags".to_string()).unwrap();
    assert_eq!(tags.len(), 3);
}

// ============================================================================
// Minimality and retry buffering
// ============================================================================

#[test]
fn test_idempotence_repeated_rounds() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::new(2, NetworkConfig::default());
    cluster.mutate(0, |set, actor| vec![set.add(actor, 42)]);

    cluster.full_sync_round();
    let after_one = cluster.replica(1).state().clone();
    cluster.reset_stats();

    for _ in 0..10 {
        cluster.full_sync_round();
    }
    assert_eq!(cluster.replica(1).state(), &after_one);
    assert_eq!(cluster.stats().deltas_sent, 0);
}

#[test]
fn test_retry_buffer_replays_parked_pushes() {
    let mut cluster: AntiEntropyCluster<OrSet<i32>> =
        AntiEntropyCluster::new(2, NetworkConfig::default());
    let mut parked: RetryBuffer<usize, Vec<sdx_core::OrSetDelta<i32>>> = RetryBuffer::new(8);

    // peer 1 is "down": pushes get parked instead of sent
    for item in 0..3 {
        let deltas = cluster.mutate(0, |set, actor| vec![set.add(actor, item)]);
        parked.push(1, deltas);
    }
    assert_eq!(parked.pending_for(&1), 3);

    // peer 1 recovers
    for push in parked.drain(&1) {
        cluster.push(0, 1, push.payload);
    }
    cluster.drain_network();

    assert!(cluster.is_converged());
    assert_eq!(cluster.replica(1).state().len(), 3);
}

proptest! {
    #[test]
    fn lossy_networks_converge_for_any_seed(seed in any::<u64>(), items in 1usize..12) {
        let mut cluster: AntiEntropyCluster<OrSet<usize>> =
            AntiEntropyCluster::new(3, NetworkConfig::lossy(0.3).seeded(seed));
        for item in 0..items {
            cluster.mutate(item % 3, |set, actor| vec![set.add(actor, item)]);
        }

        sync_until_converged(&mut cluster, 300);
        prop_assert!(cluster.is_converged());
        prop_assert_eq!(cluster.replica(0).state().len(), items);
    }
}
