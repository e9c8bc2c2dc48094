//! Node driver.
//!
//! [`RaftNode`] connects the consensus engine to real time: it owns the
//! election timer and the recurring heartbeat task on a tokio runtime and
//! interprets the commands the engine returns. The driver holds no protocol
//! state of its own; everything it does is told to it by the engine.
//!
//! Inbound RPCs are proxied through [`RaftNode::on_vote_request`] and
//! [`RaftNode::on_append_entries`] so that the commands attached to a
//! response (timer resets, step-downs) are executed on the way out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::consensus::{Consensus, ElectionCommand, EntriesCommand};
use crate::log::Log;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::state::NodeState;
use crate::term::TermId;
use crate::NodeId;

struct Timers {
    election: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    fn new() -> Self {
        Self {
            election: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }
}

/// Drives one consensus engine with tokio timers.
///
/// Cheap to clone; clones share the engine and the timer handles. Dropping
/// the last clone does not stop the timers, call [`RaftNode::shutdown`] for
/// that.
pub struct RaftNode<L: Log> {
    consensus: Arc<Consensus<L>>,
    timers: Arc<Timers>,
}

impl<L: Log> Clone for RaftNode<L> {
    fn clone(&self) -> Self {
        Self {
            consensus: Arc::clone(&self.consensus),
            timers: Arc::clone(&self.timers),
        }
    }
}

impl<L: Log> RaftNode<L> {
    /// Wraps an engine into a driver. Nothing runs until [`RaftNode::start`].
    pub fn new(consensus: Consensus<L>) -> Self {
        Self {
            consensus: Arc::new(consensus),
            timers: Arc::new(Timers::new()),
        }
    }

    /// The engine this driver runs.
    pub fn consensus(&self) -> &Arc<Consensus<L>> {
        &self.consensus
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.consensus.node_id()
    }

    /// Current role of the node.
    pub fn state(&self) -> NodeState {
        self.consensus.state()
    }

    /// True while this node leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.consensus.state().is_leader()
    }

    /// Current term id.
    pub fn current_term(&self) -> TermId {
        self.consensus.current_term()
    }

    /// The known leader of the current term.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.consensus.leader_id()
    }

    /// Arms the initial election timer. Call once after construction.
    pub fn start(&self) {
        let delay = self.consensus.next_election_timeout();
        self.reset_election_timer(delay);
    }

    /// Cancels all outstanding timers and, transitively, any fan-out still
    /// running inside them. The node stops reacting to time; inbound RPCs
    /// are still answered.
    pub fn shutdown(&self) {
        self.stop_election_timer();
        self.stop_heartbeat_task();
    }

    /// Answers a vote request from a candidate.
    pub fn on_vote_request(&self, request: VoteRequest) -> VoteResponse {
        self.consensus.on_vote_request(request)
    }

    /// Answers an append-entries request, running the commands attached to
    /// the decision before returning the response.
    pub async fn on_append_entries(
        &self,
        request: AppendEntriesRequest<L::Data>,
    ) -> AppendEntriesResponse {
        let outcome = self.consensus.on_append_entries(request);
        self.handle_entries_commands(outcome.commands).await;
        outcome.response
    }

    fn reset_election_timer(&self, delay: Duration) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            node.election_timeout().await;
        });
        if let Some(old) = self.timers.election.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_election_timer(&self) {
        if let Some(timer) = self.timers.election.lock().take() {
            timer.abort();
        }
    }

    fn reset_heartbeat_task(&self, delay: Duration) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(delay);
            loop {
                // The first tick fires immediately; the engine asked for an
                // immediate heartbeat through SendHeartbeat anyway
                ticker.tick().await;
                let commands = node.consensus.send_heartbeat().await;
                node.handle_entries_commands(commands).await;
            }
        });
        if let Some(old) = self.timers.heartbeat.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_heartbeat_task(&self) {
        if let Some(task) = self.timers.heartbeat.lock().take() {
            task.abort();
        }
    }

    async fn election_timeout(&self) {
        let command = self.consensus.on_election_timeout();
        self.handle_election_command(command).await;
    }

    /// Interprets election commands, following the pre-vote → vote → leader
    /// chain until the engine settles on a timer instruction.
    async fn handle_election_command(&self, command: ElectionCommand) {
        let mut command = command;
        loop {
            match command {
                ElectionCommand::StartPreVote => {
                    command = self.consensus.start_pre_vote().await;
                }
                ElectionCommand::StartVote => {
                    command = self.consensus.start_vote().await;
                }
                ElectionCommand::StartToBeALeader => {
                    debug!(node = self.node_id(), "became the cluster leader");
                    let commands = self.consensus.on_become_leader();
                    self.handle_entries_commands(commands).await;
                    return;
                }
                ElectionCommand::StopTimer => {
                    self.stop_election_timer();
                    return;
                }
                ElectionCommand::ScheduleNextTimer { delay } => {
                    self.reset_election_timer(delay);
                    return;
                }
            }
        }
    }

    /// Interprets entries commands. A worklist keeps the interpretation
    /// iterative even when SendHeartbeat produces follow-up commands.
    async fn handle_entries_commands(&self, commands: Vec<EntriesCommand>) {
        let mut queue: VecDeque<EntriesCommand> = commands.into();
        while let Some(command) = queue.pop_front() {
            match command {
                EntriesCommand::ResetElectionTimer { delay } => {
                    self.reset_election_timer(delay);
                }
                EntriesCommand::SendHeartbeat => {
                    queue.extend(self.consensus.send_heartbeat().await);
                }
                EntriesCommand::ScheduleHeartbeatTask { delay } => {
                    self.reset_heartbeat_task(delay);
                }
                EntriesCommand::StepDown => {
                    self.stop_heartbeat_task();
                }
            }
        }
    }
}
