//! Voting rounds for proposed blocks
//!
//! One round per proposed block hash. Each whitelisted voter gets one
//! ballot; the first ballot recorded for a voter wins. Quorum is a
//! simple majority of the whitelist with a configurable floor.

use std::collections::HashMap;

use crate::crypto::NodeId;

/// Approvals needed to commit: `max(min_votes, ceil(whitelist / 2))`.
pub fn required_approvals(min_votes: usize, whitelist_size: usize) -> usize {
    min_votes.max(whitelist_size.div_ceil(2))
}

/// Ballots for one proposed block.
#[derive(Debug, Default)]
pub struct VoteRound {
    ballots: HashMap<NodeId, bool>,
}

impl VoteRound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ballot. Returns false for a duplicate voter.
    pub fn record(&mut self, voter: NodeId, approve: bool) -> bool {
        if self.ballots.contains_key(&voter) {
            return false;
        }
        self.ballots.insert(voter, approve);
        true
    }

    pub fn approvals(&self) -> usize {
        self.ballots.values().filter(|a| **a).count()
    }

    pub fn rejections(&self) -> usize {
        self.ballots.values().filter(|a| !**a).count()
    }

    pub fn voter_count(&self) -> usize {
        self.ballots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::new(format!("{n:016x}"))
    }

    #[test]
    fn test_required_approvals() {
        assert_eq!(required_approvals(1, 1), 1);
        assert_eq!(required_approvals(1, 2), 1);
        assert_eq!(required_approvals(1, 3), 2);
        assert_eq!(required_approvals(1, 4), 2);
        assert_eq!(required_approvals(1, 5), 3);
        // The floor dominates small whitelists.
        assert_eq!(required_approvals(3, 2), 3);
    }

    #[test]
    fn test_tally() {
        let mut round = VoteRound::new();
        assert!(round.record(id(1), true));
        assert!(round.record(id(2), false));
        assert!(round.record(id(3), true));
        assert_eq!(round.approvals(), 2);
        assert_eq!(round.rejections(), 1);
    }

    #[test]
    fn test_duplicate_ballot_rejected() {
        let mut round = VoteRound::new();
        assert!(round.record(id(1), true));
        assert!(!round.record(id(1), false));
        assert_eq!(round.approvals(), 1);
        assert_eq!(round.rejections(), 0);
    }
}
