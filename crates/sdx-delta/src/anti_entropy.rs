//! Timestamp-diff anti-entropy over a simulated network.
//!
//! Replicas reconcile pairwise. The initiator sends its causal timestamp; the
//! responder streams back, in bounded batches, only the deltas that timestamp
//! does not reflect, and answers with its own timestamp so the exchange runs
//! in both directions.
//!
//! ```text
//! A -> B : Digest { ts(A), reply: true }
//! B -> A : Deltas { deltas_since(ts(A)) }   (zero or more batches)
//! B -> A : Digest { ts(B), reply: false }
//! A -> B : Deltas { deltas_since(ts(B)) }
//! ```
//!
//! The network may lose, duplicate and reorder messages. Lost deltas are never
//! retransmitted by the network itself: the next round's digest exposes the
//! gap and the peer resends exactly the missing deltas.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdx_core::delta::{next_batch, DeltaCrdt};
use std::collections::VecDeque;

/// Replica identifier inside a simulated cluster
pub type ReplicaId = String;

/// Messages exchanged by the simulated protocol
#[derive(Debug, Clone)]
pub enum SyncMessage<C: DeltaCrdt> {
    /// A timestamp; `reply` asks the receiver to answer with its own
    Digest {
        from: ReplicaId,
        to: ReplicaId,
        timestamp: C::Timestamp,
        reply: bool,
    },
    /// A bounded batch of deltas the receiver's last digest did not reflect
    Deltas {
        from: ReplicaId,
        to: ReplicaId,
        deltas: Vec<C::Delta>,
    },
}

/// Network configuration for simulation
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Probability of message loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of message duplication (0.0 - 1.0)
    pub dup_rate: f64,
    /// Probability of message reordering (0.0 - 1.0)
    pub reorder_rate: f64,
    /// Seed for the loss/duplication/reordering decisions
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            dup_rate: 0.0,
            reorder_rate: 0.0,
            seed: 12345,
        }
    }
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }

    /// Loss, duplication and reordering at once
    pub fn chaotic() -> Self {
        Self {
            loss_rate: 0.1,
            dup_rate: 0.2,
            reorder_rate: 0.3,
            ..Default::default()
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Message transport with configurable faults
#[derive(Debug)]
pub struct NetworkSimulator<M> {
    in_flight: VecDeque<M>,
    lost: u64,
    config: NetworkConfig,
    rng: StdRng,
}

impl<M: Clone> NetworkSimulator<M> {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            in_flight: VecDeque::new(),
            lost: 0,
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    pub fn send(&mut self, msg: M) {
        if self.rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            self.lost += 1;
            return;
        }
        if self.rng.gen_bool(self.config.dup_rate.clamp(0.0, 1.0)) {
            self.in_flight.push_back(msg.clone());
        }
        if !self.in_flight.is_empty() && self.rng.gen_bool(self.config.reorder_rate.clamp(0.0, 1.0)) {
            let pos = self.rng.gen_range(0..self.in_flight.len());
            self.in_flight.insert(pos, msg);
        } else {
            self.in_flight.push_back(msg);
        }
    }

    pub fn receive(&mut self) -> Option<M> {
        self.in_flight.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of messages dropped so far
    pub fn lost_count(&self) -> u64 {
        self.lost
    }
}

/// One replica of the simulated cluster
#[derive(Debug, Clone)]
pub struct SimReplica<C> {
    pub id: ReplicaId,
    state: C,
}

impl<C: DeltaCrdt> SimReplica<C> {
    pub fn new(id: impl Into<ReplicaId>) -> Self {
        Self {
            id: id.into(),
            state: C::default(),
        }
    }

    pub fn state(&self) -> &C {
        &self.state
    }
}

/// Counters describing the traffic a cluster generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub digests_sent: u64,
    pub batches_sent: u64,
    pub deltas_sent: u64,
}

/// A cluster of replicas reconciling through timestamp-diff anti-entropy
#[derive(Debug)]
pub struct AntiEntropyCluster<C: DeltaCrdt> {
    replicas: Vec<SimReplica<C>>,
    network: NetworkSimulator<SyncMessage<C>>,
    batch_size: usize,
    stats: SyncStats,
}

impl<C> AntiEntropyCluster<C>
where
    C: DeltaCrdt + Clone + std::fmt::Debug,
{
    pub fn new(n: usize, config: NetworkConfig) -> Self {
        Self::with_batch_size(n, config, 16)
    }

    pub fn with_batch_size(n: usize, config: NetworkConfig, batch_size: usize) -> Self {
        Self {
            replicas: (0..n)
                .map(|i| SimReplica::new(format!("replica_{}", i)))
                .collect(),
            network: NetworkSimulator::new(config),
            batch_size: batch_size.max(1),
            stats: SyncStats::default(),
        }
    }

    pub fn replica(&self, idx: usize) -> &SimReplica<C> {
        &self.replicas[idx]
    }

    /// Mutate a replica locally. The mutator receives the replica id as actor
    /// and returns the deltas it produced.
    pub fn mutate<F>(&mut self, replica_idx: usize, mutator: F) -> Vec<C::Delta>
    where
        F: FnOnce(&mut C, &str) -> Vec<C::Delta>,
    {
        let replica = &mut self.replicas[replica_idx];
        mutator(&mut replica.state, &replica.id)
    }

    /// Push deltas straight to other replicas, as propagation would
    pub fn push(&mut self, from_idx: usize, to_idx: usize, deltas: Vec<C::Delta>) {
        if deltas.is_empty() {
            return;
        }
        let msg = SyncMessage::Deltas {
            from: self.replicas[from_idx].id.clone(),
            to: self.replicas[to_idx].id.clone(),
            deltas,
        };
        self.stats.batches_sent += 1;
        self.network.send(msg);
    }

    /// Start a two-way exchange between two replicas
    pub fn initiate_sync(&mut self, from_idx: usize, to_idx: usize) {
        let msg = SyncMessage::Digest {
            from: self.replicas[from_idx].id.clone(),
            to: self.replicas[to_idx].id.clone(),
            timestamp: self.replicas[from_idx].state.timestamp(),
            reply: true,
        };
        self.stats.digests_sent += 1;
        self.network.send(msg);
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.replicas.iter().position(|r| r.id == id)
    }

    /// Stream every delta `peer_ts` does not reflect, in bounded batches
    fn answer_digest(&mut self, responder: usize, requester: &ReplicaId, peer_ts: C::Timestamp) {
        let mut cursor = peer_ts;
        loop {
            let batch = next_batch(&self.replicas[responder].state, &mut cursor, self.batch_size);
            if batch.is_empty() {
                break;
            }
            self.stats.batches_sent += 1;
            self.stats.deltas_sent += batch.len() as u64;
            let msg = SyncMessage::Deltas {
                from: self.replicas[responder].id.clone(),
                to: requester.clone(),
                deltas: batch,
            };
            self.network.send(msg);
        }
    }

    /// Process one network message
    pub fn process_one(&mut self) -> bool {
        let Some(msg) = self.network.receive() else {
            return false;
        };
        match msg {
            SyncMessage::Digest {
                from,
                to,
                timestamp,
                reply,
            } => {
                if let (Some(responder), Some(_)) = (self.index_of(&to), self.index_of(&from)) {
                    self.answer_digest(responder, &from, timestamp);
                    if reply {
                        let back = SyncMessage::Digest {
                            from: to,
                            to: from,
                            timestamp: self.replicas[responder].state.timestamp(),
                            reply: false,
                        };
                        self.stats.digests_sent += 1;
                        self.network.send(back);
                    }
                }
            }
            SyncMessage::Deltas { to, deltas, .. } => {
                if let Some(idx) = self.index_of(&to) {
                    self.replicas[idx].state.merge_all(deltas);
                }
            }
        }
        true
    }

    pub fn drain_network(&mut self) {
        while self.process_one() {}
    }

    /// Every replica syncs with its ring successor
    pub fn ring_sync_round(&mut self) {
        let n = self.replicas.len();
        if n < 2 {
            return;
        }
        for from_idx in 0..n {
            self.initiate_sync(from_idx, (from_idx + 1) % n);
        }
        self.drain_network();
    }

    /// Every replica syncs with every other replica
    pub fn full_sync_round(&mut self) {
        let n = self.replicas.len();
        for from_idx in 0..n {
            for to_idx in 0..n {
                if from_idx != to_idx {
                    self.initiate_sync(from_idx, to_idx);
                }
            }
        }
        self.drain_network();
    }

    /// All replicas hold the same timestamp
    pub fn is_converged(&self) -> bool {
        let Some(first) = self.replicas.first() else {
            return true;
        };
        let ts = first.state.timestamp();
        self.replicas
            .iter()
            .skip(1)
            .all(|r| r.state.timestamp() == ts)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SyncStats::default();
    }

    pub fn network(&self) -> &NetworkSimulator<SyncMessage<C>> {
        &self.network
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
