//! Node failure notification.
//!
//! Components report transport failures here; selection and propagation skip
//! nodes while they are marked. A mark clears on the next successful call or
//! lapses after the recheck interval so the node gets tried again.

use crate::ids::{NodeId, NodeInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Reachability changes observed by this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Unreachable(NodeInfo),
    Recovered(NodeInfo),
}

pub struct FailureDetector {
    recheck: Duration,
    marks: RwLock<HashMap<NodeId, (NodeInfo, Instant)>>,
    events: broadcast::Sender<NodeEvent>,
}

impl FailureDetector {
    pub fn new(recheck: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            recheck,
            marks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn report_unreachable(&self, node: &NodeInfo, reason: &str) {
        let newly_marked = self
            .marks
            .write()
            .insert(node.id.clone(), (node.clone(), Instant::now()))
            .is_none();
        if newly_marked {
            warn!(node = %node.id, address = %node.address, reason, "node unreachable");
            let _ = self.events.send(NodeEvent::Unreachable(node.clone()));
        }
    }

    pub fn report_success(&self, node: &NodeInfo) {
        let cleared = self.marks.write().remove(&node.id).is_some();
        if cleared {
            info!(node = %node.id, "node recovered");
            let _ = self.events.send(NodeEvent::Recovered(node.clone()));
        }
    }

    /// Marked and the mark has not lapsed yet.
    pub fn is_unreachable(&self, id: &NodeId) -> bool {
        self.marks
            .read()
            .get(id)
            .is_some_and(|(_, since)| since.elapsed() < self.recheck)
    }

    pub fn unreachable_nodes(&self) -> Vec<NodeInfo> {
        self.marks
            .read()
            .values()
            .filter(|(_, since)| since.elapsed() < self.recheck)
            .map(|(node, _)| node.clone())
            .collect()
    }
}

impl std::fmt::Debug for FailureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureDetector")
            .field("recheck", &self.recheck)
            .field("marked", &self.marks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::new(id), format!("mem://{}", id))
    }

    #[tokio::test]
    async fn test_unreachable_then_recovered_events() {
        let detector = FailureDetector::new(Duration::from_secs(60));
        let mut events = detector.subscribe();
        let b = node("b");

        detector.report_unreachable(&b, "connection refused");
        detector.report_unreachable(&b, "connection refused");
        assert!(detector.is_unreachable(&b.id));

        detector.report_success(&b);
        assert!(!detector.is_unreachable(&b.id));

        assert_eq!(events.recv().await.unwrap(), NodeEvent::Unreachable(b.clone()));
        assert_eq!(events.recv().await.unwrap(), NodeEvent::Recovered(b));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_lapses_after_recheck_interval() {
        let detector = FailureDetector::new(Duration::from_millis(100));
        let b = node("b");
        detector.report_unreachable(&b, "timeout");
        assert_eq!(detector.unreachable_nodes(), vec![b.clone()]);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!detector.is_unreachable(&b.id));
        assert!(detector.unreachable_nodes().is_empty());
    }
}
