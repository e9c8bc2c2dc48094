//! Term state for a single node.
//!
//! A term is a logical epoch: at most one leader can exist per term, and a
//! node may grant at most one vote per term. [`Term`] bundles the counter
//! with the vote and leader bookkeeping and enforces monotonicity; the
//! accept/reject logic in [`Term::can_accept_new_term`] is the crux of vote
//! safety.

use std::fmt;

use crate::{NodeId, RaftError, Result};

/// A Raft term number (monotonically increasing epoch).
pub type TermId = u64;

/// Latest term a node has seen, together with its vote in that term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// The node this term state belongs to.
    myself: NodeId,
    /// Current term id, starts at 0 and never decreases.
    id: TermId,
    /// Candidate that received this node's vote in the current term.
    voted_for: Option<NodeId>,
    /// Known leader of the current term.
    leader_id: Option<NodeId>,
}

impl Term {
    /// Creates term state for a fresh node (term 0, no vote, no leader).
    pub fn new(myself: NodeId) -> Self {
        Self::restore(myself, 0, None)
    }

    /// Restores term state from persisted metadata.
    pub fn restore(myself: NodeId, id: TermId, voted_for: Option<NodeId>) -> Self {
        Self {
            myself,
            id,
            voted_for,
            leader_id: None,
        }
    }

    /// Returns the current term id.
    pub fn id(&self) -> TermId {
        self.id
    }

    /// Returns the candidate this node voted for in the current term.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Returns the known leader of the current term.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Records the leader of the current term.
    pub fn set_leader(&mut self, leader: NodeId) {
        self.leader_id = Some(leader);
    }

    /// Returns the next term with a vote already cast for this node.
    ///
    /// Pure: does not mutate self. Used when starting an election round after
    /// the leader was lost.
    pub fn next_term(&self) -> Term {
        Term {
            myself: self.myself,
            id: self.id + 1,
            voted_for: Some(self.myself),
            leader_id: None,
        }
    }

    /// Adopts a strictly higher term observed from another node.
    ///
    /// Fails with [`RaftError::StaleTerm`] and leaves state untouched when
    /// `new_term` is not newer than the current one.
    pub fn try_update(&mut self, new_term: TermId, from: NodeId) -> Result<()> {
        if new_term <= self.id {
            return Err(RaftError::StaleTerm {
                proposed: new_term,
                current: self.id,
            });
        }
        self.update(new_term, Some(from));
        Ok(())
    }

    /// Accepts or rejects a candidate's term during the vote phase.
    ///
    /// A stale term is rejected outright. In the current term the node sticks
    /// with its existing vote, so a different candidate is rejected. A
    /// strictly higher term is adopted immediately and the vote goes to the
    /// proposing candidate.
    pub fn can_accept_new_term(&mut self, term: TermId, from: NodeId) -> bool {
        if self.id > term {
            // Elections from the past are never accepted
            return false;
        }
        if self.id == term && self.voted_for != Some(from) {
            // Already voted for another candidate in this term
            return false;
        }
        if self.id < term {
            self.update(term, Some(from));
        }
        true
    }

    fn update(&mut self, new_term: TermId, from: Option<NodeId>) {
        self.id = new_term;
        self.voted_for = from;
        self.leader_id = None;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_term() {
        let term = Term::new(1);
        assert_eq!(term.id(), 0);
        assert_eq!(term.voted_for(), None);
        assert_eq!(term.leader_id(), None);
    }

    #[test]
    fn test_restore() {
        let term = Term::restore(1, 7, Some(3));
        assert_eq!(term.id(), 7);
        assert_eq!(term.voted_for(), Some(3));
        assert_eq!(term.leader_id(), None);
    }

    #[test]
    fn test_next_term_votes_for_self() {
        let term = Term::restore(1, 4, Some(2));
        let next = term.next_term();

        assert_eq!(next.id(), 5);
        assert_eq!(next.voted_for(), Some(1));
        assert_eq!(next.leader_id(), None);

        // next_term is pure
        assert_eq!(term.id(), 4);
        assert_eq!(term.voted_for(), Some(2));
    }

    #[test]
    fn test_try_update_rejects_stale_term() {
        let mut term = Term::restore(1, 5, Some(2));

        assert!(matches!(
            term.try_update(3, 9),
            Err(RaftError::StaleTerm { proposed: 3, current: 5 })
        ));
        assert!(term.try_update(5, 9).is_err());

        // State untouched after rejection
        assert_eq!(term.id(), 5);
        assert_eq!(term.voted_for(), Some(2));
    }

    #[test]
    fn test_try_update_adopts_higher_term() {
        let mut term = Term::restore(1, 5, Some(2));
        term.set_leader(2);

        term.try_update(8, 4).unwrap();
        assert_eq!(term.id(), 8);
        assert_eq!(term.voted_for(), Some(4));
        assert_eq!(term.leader_id(), None);
    }

    #[test]
    fn test_id_never_decreases() {
        let mut term = Term::new(1);
        let mut last = term.id();
        for (proposed, from) in [(3, 2), (1, 3), (3, 4), (7, 2), (5, 5)] {
            let _ = term.try_update(proposed, from);
            assert!(term.id() >= last);
            last = term.id();
        }
        assert_eq!(term.id(), 7);
    }

    #[test]
    fn test_accept_rejects_past_term() {
        let mut term = Term::restore(1, 5, None);
        assert!(!term.can_accept_new_term(3, 2));
        assert_eq!(term.id(), 5);
        assert_eq!(term.voted_for(), None);
    }

    #[test]
    fn test_accept_single_vote_per_term() {
        let mut term = Term::new(1);

        assert!(term.can_accept_new_term(1, 2));
        assert_eq!(term.voted_for(), Some(2));

        // Second candidate in the same term is refused
        assert!(!term.can_accept_new_term(1, 3));
        assert_eq!(term.voted_for(), Some(2));

        // The candidate we already voted for is still accepted
        assert!(term.can_accept_new_term(1, 2));
        assert_eq!(term.id(), 1);
    }

    #[test]
    fn test_accept_higher_term_moves_vote() {
        let mut term = Term::new(1);
        assert!(term.can_accept_new_term(1, 2));
        assert!(term.can_accept_new_term(2, 3));
        assert_eq!(term.id(), 2);
        assert_eq!(term.voted_for(), Some(3));
    }

    #[test]
    fn test_accept_clears_leader_on_new_term() {
        let mut term = Term::restore(1, 2, None);
        term.set_leader(4);
        assert!(term.can_accept_new_term(3, 2));
        assert_eq!(term.leader_id(), None);
    }
}
