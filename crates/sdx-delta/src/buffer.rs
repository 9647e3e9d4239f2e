//! Bounded per-peer buffer for pushes that could not be delivered.
//!
//! When a push to a peer fails because the peer is unreachable, the payload is
//! parked here and replayed before the next push to that peer or when the
//! peer recovers. Each peer's queue is bounded; once full, the oldest entry is
//! evicted. Evicted payloads are not lost for good: anti-entropy repairs them
//! by timestamp diffing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Sequence number assigned to every parked payload
pub type SeqNo = u64;

/// A payload tagged with its parking order
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaggedPush<M> {
    pub seq: SeqNo,
    pub payload: M,
}

#[derive(Debug, Clone)]
pub struct RetryBuffer<P: Ord, M> {
    /// Last sequence number handed out
    current_seq: SeqNo,
    /// Parked payloads per peer, oldest first
    pending: BTreeMap<P, VecDeque<TaggedPush<M>>>,
    /// Maximum payloads kept per peer
    capacity: usize,
    /// Payloads dropped to respect `capacity`
    evicted: u64,
}

impl<P: Ord + Clone, M> RetryBuffer<P, M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            current_seq: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Park a payload for `peer`. Returns the payload evicted to make room.
    pub fn push(&mut self, peer: P, payload: M) -> Option<TaggedPush<M>> {
        self.current_seq += 1;
        let queue = self.pending.entry(peer).or_default();
        queue.push_back(TaggedPush {
            seq: self.current_seq,
            payload,
        });

        if queue.len() > self.capacity {
            self.evicted += 1;
            queue.pop_front()
        } else {
            None
        }
    }

    /// Take everything parked for `peer`, oldest first.
    pub fn drain(&mut self, peer: &P) -> Vec<TaggedPush<M>> {
        self.pending
            .remove(peer)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Put payloads back at the front of `peer`'s queue after a failed replay,
    /// keeping their original order. Oldest payloads beyond capacity are dropped.
    pub fn requeue(&mut self, peer: P, pushes: Vec<TaggedPush<M>>) {
        if pushes.is_empty() {
            return;
        }
        let queue = self.pending.entry(peer).or_default();
        for push in pushes.into_iter().rev() {
            queue.push_front(push);
        }
        while queue.len() > self.capacity {
            queue.pop_front();
            self.evicted += 1;
        }
    }

    /// Number of payloads parked for `peer`
    pub fn pending_for(&self, peer: &P) -> usize {
        self.pending.get(peer).map_or(0, VecDeque::len)
    }

    /// Peers with parked payloads
    pub fn peers(&self) -> impl Iterator<Item = &P> {
        self.pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(peer, _)| peer)
    }

    /// Total number of parked payloads
    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads dropped so far because a peer's queue was full
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn current_seq(&self) -> SeqNo {
        self.current_seq
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything parked for `peer`
    pub fn clear(&mut self, peer: &P) {
        self.pending.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_buffer_basic() {
        let mut buffer: RetryBuffer<String, i32> = RetryBuffer::new(10);

        assert!(buffer.push("peer1".to_string(), 1).is_none());
        assert!(buffer.push("peer1".to_string(), 2).is_none());
        assert!(buffer.push("peer2".to_string(), 3).is_none());

        assert_eq!(buffer.current_seq(), 3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.pending_for(&"peer1".to_string()), 2);
        assert_eq!(buffer.peers().count(), 2);
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut buffer: RetryBuffer<&str, i32> = RetryBuffer::new(10);
        for i in 1..=4 {
            buffer.push("peer", i);
        }

        let drained: Vec<i32> = buffer.drain(&"peer").into_iter().map(|p| p.payload).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(buffer.is_empty());
        assert!(buffer.drain(&"peer").is_empty());
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let mut buffer: RetryBuffer<&str, i32> = RetryBuffer::new(3);
        for i in 1..=3 {
            assert!(buffer.push("peer", i).is_none());
        }

        let evicted = buffer.push("peer", 4).unwrap();
        assert_eq!(evicted.payload, 1);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(buffer.pending_for(&"peer"), 3);

        // other peers have their own budget
        assert!(buffer.push("other", 9).is_none());
    }

    #[test]
    fn test_requeue_after_failed_replay() {
        let mut buffer: RetryBuffer<&str, i32> = RetryBuffer::new(3);
        buffer.push("peer", 1);
        buffer.push("peer", 2);

        let replay = buffer.drain(&"peer");
        // a fresh push lands while the replay is in flight
        buffer.push("peer", 3);
        buffer.requeue("peer", replay);

        let order: Vec<i32> = buffer.drain(&"peer").into_iter().map(|p| p.payload).collect();
        assert_eq!(order, vec![1, 2, 3]);

        buffer.push("peer", 4);
        buffer.push("peer", 5);
        buffer.requeue(
            "peer",
            vec![
                TaggedPush { seq: 1, payload: 1 },
                TaggedPush { seq: 2, payload: 2 },
            ],
        );
        let order: Vec<i32> = buffer.drain(&"peer").into_iter().map(|p| p.payload).collect();
        assert_eq!(order, vec![2, 4, 5]);
        assert_eq!(buffer.evicted(), 1);
    }

    #[test]
    fn test_zero_capacity_still_keeps_latest() {
        let mut buffer: RetryBuffer<&str, i32> = RetryBuffer::new(0);
        buffer.push("peer", 1);
        buffer.push("peer", 2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.drain(&"peer")[0].payload, 2);
    }
}
