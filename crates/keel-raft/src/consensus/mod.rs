//! The consensus engine.
//!
//! [`Consensus`] owns the term, role, log handle and peer set of one node and
//! implements the election and append-entries protocols. It performs no side
//! effects of its own: every entry point returns *commands* telling the
//! driver which timers to arm and which RPC rounds to run. The engine is
//! therefore testable with nothing but a fake peer and an in-memory log.
//!
//! # Locking
//!
//! All mutable state sits behind one mutex that is only held across
//! synchronous sections. Vote and heartbeat fan-outs run outside the lock;
//! any result arriving after the term has moved on is discarded by a
//! term-not-changed guard before it can complete a stale round.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, warn};

use crate::config::RaftConfig;
use crate::log::{Log, LogMetadata};
use crate::peer::{quorum_size, Peer};
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse, VoteType};
use crate::state::NodeState;
use crate::term::{Term, TermId};
use crate::{LogIndex, NodeId, Result};

/// Commands describing changes in the election process.
///
/// Returned by the engine for the driver to interpret; the engine never
/// schedules a timer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionCommand {
    /// Stop the election timer; the node is no longer waiting on one.
    StopTimer,
    /// Schedule the next round of the election timer.
    ScheduleNextTimer {
        /// Randomized delay until the timer fires.
        delay: Duration,
    },
    /// The node is ready to run a pre-vote round.
    StartPreVote,
    /// The node is ready to run a real election.
    StartVote,
    /// The election was won; time to act as the cluster leader.
    StartToBeALeader,
}

/// Commands emitted by the append-entries/heartbeat side of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntriesCommand {
    /// Re-arm the election timer; the node is not the leader.
    ResetElectionTimer {
        /// Randomized delay until the timer fires.
        delay: Duration,
    },
    /// Broadcast a heartbeat to all peers now.
    SendHeartbeat,
    /// Arm the recurring heartbeat task.
    ScheduleHeartbeatTask {
        /// The fixed heartbeat period.
        delay: Duration,
    },
    /// Leave the leader role behind.
    StepDown,
}

/// Result of processing an append-entries request: the wire response plus the
/// side effects the driver must perform.
#[derive(Debug)]
pub struct AppendOutcome {
    /// The response to return to the calling leader.
    pub response: AppendEntriesResponse,
    /// Side effects for the driver.
    pub commands: Vec<EntriesCommand>,
}

struct Inner<L: Log> {
    term: Term,
    state: NodeState,
    log: L,
    commit_index: LogIndex,
    rng: SmallRng,
}

impl<L: Log> Inner<L> {
    /// The only place a role change happens. Illegal transitions are refused
    /// and leave the state untouched.
    fn try_move_to(&mut self, next: NodeState) -> bool {
        if self.state.is_valid_next(next) {
            self.state = next;
            return true;
        }
        false
    }

    fn persist_term(&mut self) {
        let metadata = LogMetadata::from_term(&self.term);
        self.log.set_metadata(metadata);
    }

    /// Standard log reconciliation: the previous entry must match, a
    /// conflicting suffix is dropped, new entries are appended and the commit
    /// index follows the leader's.
    fn reconcile_log(&mut self, request: &AppendEntriesRequest<L::Data>) -> bool {
        if request.prev_log_index != 0 {
            match self.log.entry(request.prev_log_index) {
                Ok(prev) if prev.term() == request.prev_log_term => {}
                _ => return false,
            }
        }

        let mut to_append = Vec::new();
        for (pos, entry) in request.entries.iter().enumerate() {
            match self.log.entry(entry.index()) {
                Ok(existing) if existing.term() == entry.term() => continue,
                Ok(_) => {
                    // Same index, different term: the leader's version wins
                    self.log.truncate_suffix(entry.index().saturating_sub(1));
                    to_append = request.entries[pos..].to_vec();
                    break;
                }
                Err(_) => {
                    to_append = request.entries[pos..].to_vec();
                    break;
                }
            }
        }
        if !to_append.is_empty() {
            self.log.append(to_append);
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.log.last_index());
        }
        true
    }
}

/// The consensus engine for one cluster member.
///
/// Construct it with a validated [`RaftConfig`], the peer set and the node's
/// log; term and vote are seeded from the log's persisted metadata. All
/// methods serialize on the engine's internal lock, so one instance can be
/// shared behind an [`Arc`].
pub struct Consensus<L: Log> {
    config: RaftConfig,
    myself: NodeId,
    peers: Vec<Arc<dyn Peer<L::Data>>>,
    inner: Mutex<Inner<L>>,
}

impl<L: Log> Consensus<L> {
    /// Creates an engine seeded from the log's metadata.
    ///
    /// Fails when the configuration violates the heartbeat/election timing
    /// precondition.
    pub fn new(config: RaftConfig, peers: Vec<Arc<dyn Peer<L::Data>>>, log: L) -> Result<Self> {
        Self::with_rng(config, peers, log, SmallRng::from_entropy())
    }

    /// Same as [`Consensus::new`] with an explicit randomness source, for
    /// deterministic timer jitter in tests.
    pub fn with_rng(
        config: RaftConfig,
        peers: Vec<Arc<dyn Peer<L::Data>>>,
        log: L,
        rng: SmallRng,
    ) -> Result<Self> {
        config.validate()?;

        let metadata = log.metadata();
        let term = Term::restore(config.id, metadata.term.unwrap_or(0), metadata.voted_for);
        debug!(
            first = log.first_index(),
            last = log.last_index(),
            "the log contains these indexes"
        );

        Ok(Self {
            myself: config.id,
            peers,
            inner: Mutex::new(Inner {
                term,
                state: NodeState::Follower,
                log,
                commit_index: 0,
                rng,
            }),
            config,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.myself
    }

    /// Current role of the node.
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Current term id.
    pub fn current_term(&self) -> TermId {
        self.inner.lock().term.id()
    }

    /// The candidate this node voted for in the current term.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.lock().term.voted_for()
    }

    /// The known leader of the current term.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.lock().term.leader_id()
    }

    /// Highest log index known to be committed.
    pub fn commit_index(&self) -> LogIndex {
        self.inner.lock().commit_index
    }

    /// A freshly randomized election timeout, for the driver's initial timer.
    pub fn next_election_timeout(&self) -> Duration {
        let mut inner = self.inner.lock();
        self.config.next_election_timeout(&mut inner.rng)
    }

    fn schedule_next(&self) -> ElectionCommand {
        let mut inner = self.inner.lock();
        let delay = self.config.next_election_timeout(&mut inner.rng);
        ElectionCommand::ScheduleNextTimer { delay }
    }
}

// Election
impl<L: Log> Consensus<L> {
    /// The election timer fired; plan the next step.
    ///
    /// Leaders stop the timer, everyone else tries to open a campaign with a
    /// pre-vote. If the role cannot move right now the timer is simply
    /// re-armed.
    pub fn on_election_timeout(&self) -> ElectionCommand {
        let mut inner = self.inner.lock();
        if inner.state.is_leader() {
            return ElectionCommand::StopTimer;
        }
        debug!(node = self.myself, "starting an election campaign");
        if inner.try_move_to(NodeState::PreCandidate) {
            return ElectionCommand::StartPreVote;
        }
        let delay = self.config.next_election_timeout(&mut inner.rng);
        ElectionCommand::ScheduleNextTimer { delay }
    }

    /// Runs the non-binding trial round.
    ///
    /// The round estimates winnability without touching the persistent term
    /// or vote, so a lost race leaves the current leader's term undisturbed.
    pub async fn start_pre_vote(&self) -> ElectionCommand {
        {
            let mut inner = self.inner.lock();
            let _ = inner.try_move_to(NodeState::PreCandidate);
        }
        if self.run_vote_round(VoteType::PreVote).await {
            debug!("won the pre-vote round, starting a real vote");
            return ElectionCommand::StartVote;
        }
        warn!(term = self.current_term(), "lost the pre-vote round");
        self.schedule_next()
    }

    /// Runs the real election round.
    pub async fn start_vote(&self) -> ElectionCommand {
        {
            let mut inner = self.inner.lock();
            let _ = inner.try_move_to(NodeState::Candidate);
        }
        let won = self.run_vote_round(VoteType::Vote).await;
        debug!(
            result = won,
            term = self.current_term(),
            "finished the campaign"
        );
        if won && self.inner.lock().try_move_to(NodeState::Leader) {
            return ElectionCommand::StartToBeALeader;
        }
        debug!(term = self.current_term(), "failed to become the leader");
        self.schedule_next()
    }

    /// Shared vote round for both the pre-vote and the real vote.
    ///
    /// Broadcasts to every peer concurrently, counts the local vote up front
    /// and returns as soon as the tally reaches quorum; stragglers are
    /// aborted. An RPC error or timeout is a non-grant, never a failure of
    /// the round itself.
    async fn run_vote_round(&self, vote_type: VoteType) -> bool {
        let (request, round_term) = {
            let mut inner = self.inner.lock();
            let next = inner.term.next_term();
            if vote_type == VoteType::Vote {
                // Only a real vote advances the persistent term
                inner.term = next.clone();
                inner.persist_term();
            }
            let request = VoteRequest {
                vote_type,
                term_id: next.id(),
                candidate_id: self.myself,
                last_log_index: inner.log.last_index(),
                last_log_term: inner.log.last_term(),
            };
            (request, next.id())
        };

        let needed = quorum_size(&self.peers) as u64;
        debug!(term = round_term, kind = ?vote_type, "starting a vote round");

        let mut granted: u64 = 1; // the local vote counts immediately
        if granted >= needed {
            return true;
        }

        let mut requests = JoinSet::new();
        for peer in &self.peers {
            let peer = Arc::clone(peer);
            let deadline = self.config.vote_rpc_timeout;
            requests.spawn(async move {
                let target = peer.id();
                match time::timeout(deadline, peer.request_vote(request)).await {
                    Ok(Ok(response)) => response.vote_granted,
                    Ok(Err(err)) => {
                        warn!(peer = target, error = %err, "vote request failed");
                        false
                    }
                    Err(_) => {
                        warn!(peer = target, "vote request timed out");
                        false
                    }
                }
            });
        }

        while let Some(joined) = requests.join_next().await {
            if !matches!(joined, Ok(true)) {
                continue;
            }
            // A late grant must not complete a round the term moved past
            if vote_type == VoteType::Vote && self.inner.lock().term.id() != round_term {
                return false;
            }
            granted += 1;
            if granted >= needed {
                requests.abort_all();
                return true;
            }
        }
        false
    }

    /// Handles a vote or pre-vote request from a candidate.
    ///
    /// A caller with a less complete log never takes our vote. A pre-vote is
    /// answered without any state change; a real vote goes through the term's
    /// accept logic and may adopt the candidate's term.
    pub fn on_vote_request(&self, request: VoteRequest) -> VoteResponse {
        let mut inner = self.inner.lock();

        let last_log_term = inner.log.last_term();
        let last_log_index = inner.log.last_index();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        let granted = match request.vote_type {
            VoteType::PreVote => log_ok && request.term_id > inner.term.id(),
            VoteType::Vote => {
                let accepted = log_ok
                    && inner
                        .term
                        .can_accept_new_term(request.term_id, request.candidate_id);
                if accepted {
                    inner.persist_term();
                }
                accepted
            }
        };
        debug!(
            node = self.myself,
            candidate = request.candidate_id,
            granted,
            "vote response"
        );
        VoteResponse {
            vote_type: request.vote_type,
            term_id: inner.term.id(),
            vote_granted: granted,
        }
    }
}

// Entries
impl<L: Log> Consensus<L> {
    /// The node won its election; emit the commands that make it act as the
    /// leader. Returns nothing when the role was lost in between.
    pub fn on_become_leader(&self) -> Vec<EntriesCommand> {
        let inner = self.inner.lock();
        if !inner.state.is_leader() {
            return Vec::new();
        }
        vec![
            EntriesCommand::SendHeartbeat,
            EntriesCommand::ScheduleHeartbeatTask {
                delay: self.config.heartbeat_period,
            },
        ]
    }

    /// Broadcasts an empty append-entries call to every peer.
    ///
    /// Only valid while leader: a stale scheduled task firing after a role
    /// change gets `[StepDown, ResetElectionTimer]` back and contacts nobody.
    /// Every peer's response is awaited and inspected; a refusal is logged
    /// but never acted upon from here.
    pub async fn send_heartbeat(&self) -> Vec<EntriesCommand> {
        let request = {
            let mut inner = self.inner.lock();
            if !inner.state.is_leader() {
                error!(
                    state = %inner.state,
                    "a non-leader attempted to send a heartbeat"
                );
                let delay = self.config.next_election_timeout(&mut inner.rng);
                return vec![
                    EntriesCommand::StepDown,
                    EntriesCommand::ResetElectionTimer { delay },
                ];
            }
            AppendEntriesRequest::heartbeat(inner.term.id(), self.myself, inner.commit_index)
        };

        let mut calls = JoinSet::new();
        for peer in &self.peers {
            let peer = Arc::clone(peer);
            let request = request.clone();
            let deadline = self.config.append_rpc_timeout;
            calls.spawn(async move {
                let target = peer.id();
                match time::timeout(deadline, peer.send_heartbeat(request)).await {
                    Ok(Ok(response)) => (target, Some(response)),
                    Ok(Err(err)) => {
                        warn!(peer = target, error = %err, "heartbeat failed");
                        (target, None)
                    }
                    Err(_) => {
                        warn!(peer = target, "heartbeat timed out");
                        (target, None)
                    }
                }
            });
        }
        while let Some(joined) = calls.join_next().await {
            if let Ok((target, Some(response))) = joined {
                if !response.success {
                    warn!(
                        peer = target,
                        term = response.term_id,
                        "peer did not accept entries"
                    );
                }
            }
        }
        Vec::new()
    }

    /// Handles an append-entries request from a leader.
    ///
    /// The term gate is canonical: an older term is rejected outright with no
    /// state change; a newer term deposes us into follower; the current term
    /// reaffirms follower status and reconciles the log.
    pub fn on_append_entries(&self, request: AppendEntriesRequest<L::Data>) -> AppendOutcome {
        let mut inner = self.inner.lock();

        if request.term_id < inner.term.id() {
            // Stale leader: echo our term, change nothing
            return AppendOutcome {
                response: AppendEntriesResponse {
                    term_id: inner.term.id(),
                    success: false,
                },
                commands: Vec::new(),
            };
        }

        if request.term_id > inner.term.id() {
            return self.step_down(&mut inner, request.term_id, request.leader_id);
        }

        if inner.term.leader_id().is_none() {
            inner.term.set_leader(request.leader_id);
        }
        debug!(
            term = request.term_id,
            leader = request.leader_id,
            "received entries from the leader"
        );

        let moved = inner.try_move_to(NodeState::Follower);
        if !moved {
            debug!(state = %inner.state, "could not reaffirm follower state");
        }
        let log_ok = inner.reconcile_log(&request);

        let mut commands = Vec::new();
        if !inner.state.is_leader() {
            // Re-arming the election timer here is what keeps a live leader
            // from being deposed
            let delay = self.config.next_election_timeout(&mut inner.rng);
            commands.push(EntriesCommand::ResetElectionTimer { delay });
        }
        AppendOutcome {
            response: AppendEntriesResponse {
                term_id: inner.term.id(),
                success: moved && log_ok,
            },
            commands,
        }
    }

    /// A message with a higher term arrived: adopt it and become a follower.
    /// The stale leader retries against the new term on its next attempt.
    fn step_down(
        &self,
        inner: &mut Inner<L>,
        new_term: TermId,
        leader: NodeId,
    ) -> AppendOutcome {
        match inner.term.try_update(new_term, leader) {
            Ok(()) => inner.persist_term(),
            Err(err) => error!(
                term = new_term,
                error = %err,
                "error on stepping down into the new term"
            ),
        }
        if !inner.try_move_to(NodeState::Follower) {
            debug!(
                state = %inner.state,
                "got a higher term but could not move to follower"
            );
        }
        let delay = self.config.next_election_timeout(&mut inner.rng);
        AppendOutcome {
            response: AppendEntriesResponse {
                term_id: inner.term.id(),
                success: false,
            },
            commands: vec![EntriesCommand::ResetElectionTimer { delay }],
        }
    }
}

#[cfg(test)]
impl<L: Log> Consensus<L> {
    pub(crate) fn become_leader_in_term(&self, id: TermId) {
        let mut inner = self.inner.lock();
        inner.state = NodeState::Leader;
        inner.term = Term::restore(self.myself, id, None);
    }

    pub(crate) fn force_state(&self, state: NodeState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn force_term(&self, id: TermId) {
        let mut inner = self.inner.lock();
        inner.term = Term::restore(self.myself, id, None);
    }

    pub(crate) fn stored_metadata(&self) -> LogMetadata {
        self.inner.lock().log.metadata()
    }
}
