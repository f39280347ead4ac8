//! Leader-side replication progress

use raft_kv_core::{LogIndex, NodeId};
use std::collections::BTreeMap;

/// What the leader knows about one follower's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next log index to send to the follower
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the follower
    pub match_index: Option<LogIndex>,
}

/// Progress of every follower during one leadership session
///
/// A tracker is built by the transition to leader and dropped when the node
/// steps down; it is never carried into another session.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    peers: BTreeMap<NodeId, PeerProgress>,
}

impl ProgressTracker {
    /// Fresh progress for `peers`, given the leader's log length
    pub fn new(peers: impl IntoIterator<Item = NodeId>, log_len: usize) -> Self {
        let peers = peers
            .into_iter()
            .map(|id| {
                (
                    id,
                    PeerProgress {
                        next_index: log_len as LogIndex,
                        match_index: None,
                    },
                )
            })
            .collect();
        Self { peers }
    }

    pub fn get(&self, peer: NodeId) -> Option<&PeerProgress> {
        self.peers.get(&peer)
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Start tracking a peer that joined mid-session
    pub fn insert_peer(&mut self, peer: NodeId, log_len: usize) {
        self.peers.entry(peer).or_insert(PeerProgress {
            next_index: log_len as LogIndex,
            match_index: None,
        });
    }

    pub fn remove_peer(&mut self, peer: NodeId) {
        self.peers.remove(&peer);
    }

    /// The follower holds every entry up to `matched`
    ///
    /// Match indexes never move backwards: a delayed reply for a shorter
    /// request cannot undo a later, longer acknowledgement.
    pub fn record_success(&mut self, peer: NodeId, matched: Option<LogIndex>) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.match_index.map_or(0, |m| m + 1);
        }
    }

    /// The follower's log did not contain the previous entry; step back one.
    /// Returns false once there is nothing left to step back over.
    pub fn record_mismatch(&mut self, peer: NodeId) -> bool {
        match self.peers.get_mut(&peer) {
            Some(progress) if progress.next_index > 0 => {
                progress.next_index -= 1;
                true
            }
            _ => false,
        }
    }

    /// Highest index stored on a majority of the cluster, the leader included
    pub fn majority_match(&self, leader_last_index: Option<LogIndex>) -> Option<LogIndex> {
        let mut matches: Vec<Option<LogIndex>> =
            self.peers.values().map(|p| p.match_index).collect();
        matches.push(leader_last_index);
        matches.sort();
        // With n nodes sorted ascending, the value at (n - 1) / 2 is held by
        // at least n - (n - 1) / 2 nodes, which is a strict majority.
        matches[(matches.len() - 1) / 2]
    }

    pub fn peers(&self) -> impl Iterator<Item = (&NodeId, &PeerProgress)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_progress() {
        let tracker = ProgressTracker::new([2, 3], 5);
        let p = tracker.get(2).unwrap();
        assert_eq!(p.next_index, 5);
        assert_eq!(p.match_index, None);
    }

    #[test]
    fn test_success_advances_and_never_regresses() {
        let mut tracker = ProgressTracker::new([2], 0);
        tracker.record_success(2, Some(4));
        assert_eq!(tracker.get(2).unwrap().match_index, Some(4));
        assert_eq!(tracker.get(2).unwrap().next_index, 5);

        tracker.record_success(2, Some(1));
        assert_eq!(tracker.get(2).unwrap().match_index, Some(4));
        assert_eq!(tracker.get(2).unwrap().next_index, 5);
    }

    #[test]
    fn test_mismatch_steps_back_until_zero() {
        let mut tracker = ProgressTracker::new([2], 2);
        assert!(tracker.record_mismatch(2));
        assert_eq!(tracker.get(2).unwrap().next_index, 1);
        assert!(tracker.record_mismatch(2));
        assert_eq!(tracker.get(2).unwrap().next_index, 0);
        assert!(!tracker.record_mismatch(2));
        assert!(!tracker.record_mismatch(9));
    }

    #[test]
    fn test_majority_match_three_nodes() {
        let mut tracker = ProgressTracker::new([2, 3], 0);
        assert_eq!(tracker.majority_match(Some(3)), None);

        tracker.record_success(2, Some(2));
        assert_eq!(tracker.majority_match(Some(3)), Some(2));

        tracker.record_success(3, Some(3));
        assert_eq!(tracker.majority_match(Some(3)), Some(3));
    }

    #[test]
    fn test_majority_match_even_cluster_needs_three_of_four() {
        let mut tracker = ProgressTracker::new([2, 3, 4], 0);
        tracker.record_success(2, Some(5));
        // Leader and one follower hold index 5: only 2 of 4
        assert_eq!(tracker.majority_match(Some(5)), None);

        tracker.record_success(3, Some(4));
        assert_eq!(tracker.majority_match(Some(5)), Some(4));
    }

    #[test]
    fn test_single_node_majority_is_leader() {
        let tracker = ProgressTracker::new([], 0);
        assert_eq!(tracker.majority_match(Some(7)), Some(7));
    }
}
