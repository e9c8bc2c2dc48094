//! Consensus RPC message types.
//!
//! Two message pairs drive the protocol:
//! - `VoteRequest`/`VoteResponse`, used for both pre-vote and real vote rounds
//! - `AppendEntriesRequest`/`AppendEntriesResponse`, used for replication and
//!   heartbeats (an append with no entries)
//!
//! ```text
//! Election:
//!   Candidate ──VoteRequest──▶ Voter
//!   Candidate ◀──VoteResponse── Voter
//!
//! Replication / heartbeat:
//!   Leader ──AppendEntriesRequest──▶ Follower
//!   Leader ◀──AppendEntriesResponse── Follower
//! ```

use serde::{Deserialize, Serialize};

use crate::log::{LogData, LogElement};
use crate::term::TermId;
use crate::{LogIndex, NodeId};

/// Distinguishes the non-binding pre-vote round from a real vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteType {
    /// Trial round: winning it does not change any term state anywhere.
    PreVote,
    /// Binding round: the candidate advanced its term and voted for itself.
    Vote,
}

/// Vote request, sent by a (pre-)candidate to every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Pre-vote or real vote.
    pub vote_type: VoteType,
    /// Candidate's term.
    pub term_id: TermId,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

/// Vote response. `vote_type` always echoes the request's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Pre-vote or real vote, same as in the request.
    pub vote_type: VoteType,
    /// Current term of the voter, for the candidate to update itself.
    pub term_id: TermId,
    /// True when the candidate received the vote.
    pub vote_granted: bool,
}

impl VoteResponse {
    /// Builds a granting response.
    pub fn grant(vote_type: VoteType, term_id: TermId) -> Self {
        Self {
            vote_type,
            term_id,
            vote_granted: true,
        }
    }

    /// Builds a denying response.
    pub fn deny(vote_type: VoteType, term_id: TermId) -> Self {
        Self {
            vote_type,
            term_id,
            vote_granted: false,
        }
    }
}

/// Append-entries request: log replication and, with no entries, heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: LogData")]
pub struct AppendEntriesRequest<D: LogData> {
    /// Leader's term. Followers use it to validate the sender.
    pub term_id: TermId,
    /// The leader's id in the cluster.
    pub leader_id: NodeId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: TermId,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<LogElement<D>>,
}

impl<D: LogData> AppendEntriesRequest<D> {
    /// Builds a heartbeat: an append-entries call carrying no entries.
    pub fn heartbeat(term_id: TermId, leader_id: NodeId, leader_commit: LogIndex) -> Self {
        Self {
            term_id,
            leader_id,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit,
            entries: Vec::new(),
        }
    }

    /// True when the request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-entries response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term of the responder, for the leader to update itself.
    pub term_id: TermId,
    /// True when the follower accepted the entries.
    pub success: bool,
}
