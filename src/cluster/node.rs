//! Consensus capability
//!
//! The consumer proposes delivery-state updates and observes leadership
//! through this trait; the actual replication transport lives outside the
//! subsystem. `BufferedNode` is the in-process implementation: it parks
//! proposals until the embedder (or a test) drains and applies them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterError {
    NotLeader,
    ProposalFailed(String),
    Closed,
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::NotLeader => write!(f, "node is not the group leader"),
            ClusterError::ProposalFailed(msg) => write!(f, "proposal failed: {}", msg),
            ClusterError::Closed => write!(f, "consensus node is closed"),
        }
    }
}

impl std::error::Error for ClusterError {}

pub trait ConsensusNode: Send + Sync {
    fn propose(&self, entry: Bytes) -> Result<(), ClusterError>;
    fn propose_multi(&self, entries: Vec<Bytes>) -> Result<(), ClusterError>;
    fn leader(&self) -> bool;
    fn leaderless(&self) -> bool;
    fn step_down(&self, preferred: Option<String>) -> Result<(), ClusterError>;
    fn peers(&self) -> Vec<String>;
    fn created(&self) -> DateTime<Utc>;
    fn quit(&self) -> CancellationToken;
}

// ==========================================
// BUFFERED NODE
// ==========================================

pub struct BufferedNode {
    proposals: Mutex<Vec<Bytes>>,
    is_leader: AtomicBool,
    created: DateTime<Utc>,
    quit: CancellationToken,
}

impl BufferedNode {
    pub fn new(leader: bool) -> Self {
        Self {
            proposals: Mutex::new(Vec::new()),
            is_leader: AtomicBool::new(leader),
            created: Utc::now(),
            quit: CancellationToken::new(),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::Release);
    }

    /// Drain parked proposals. The caller decides when they "commit" and
    /// feeds them back through the consumers' apply path.
    pub fn take_proposals(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.proposals.lock())
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.lock().len()
    }
}

impl ConsensusNode for BufferedNode {
    fn propose(&self, entry: Bytes) -> Result<(), ClusterError> {
        if self.quit.is_cancelled() {
            return Err(ClusterError::Closed);
        }
        self.proposals.lock().push(entry);
        Ok(())
    }

    fn propose_multi(&self, entries: Vec<Bytes>) -> Result<(), ClusterError> {
        if self.quit.is_cancelled() {
            return Err(ClusterError::Closed);
        }
        self.proposals.lock().extend(entries);
        Ok(())
    }

    fn leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    fn leaderless(&self) -> bool {
        false
    }

    fn step_down(&self, _preferred: Option<String>) -> Result<(), ClusterError> {
        self.is_leader.store(false, Ordering::Release);
        Ok(())
    }

    fn peers(&self) -> Vec<String> {
        Vec::new()
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn quit(&self) -> CancellationToken {
        self.quit.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_node_parks_proposals() {
        let node = BufferedNode::new(true);
        node.propose(Bytes::from_static(b"a")).unwrap();
        node.propose_multi(vec![Bytes::from_static(b"b")]).unwrap();
        assert_eq!(node.proposal_count(), 2);
        assert_eq!(node.take_proposals().len(), 2);
        assert_eq!(node.proposal_count(), 0);
    }

    #[test]
    fn test_step_down_clears_leadership() {
        let node = BufferedNode::new(true);
        assert!(node.leader());
        node.step_down(None).unwrap();
        assert!(!node.leader());
    }
}
