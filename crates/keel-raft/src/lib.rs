//! # keel-raft
//!
//! Raft-family consensus core: leader election with a pre-vote extension,
//! term management, and append-entries/heartbeat replication behind a
//! transport-agnostic peer abstraction.
//!
//! The crate is meant to be embedded in a node process that owns the network
//! transport and the application state machine. The [`consensus::Consensus`]
//! engine makes protocol decisions and returns *commands* describing the
//! required side effects (timer resets, RPC fan-outs); the [`node::RaftNode`]
//! driver interprets those commands on a tokio runtime. This split keeps the
//! protocol logic unit-testable without a real clock or network.
//!
//! # Components
//!
//! - [`term::Term`]: monotonic term counter and vote bookkeeping
//! - [`state::NodeState`]: follower/pre-candidate/candidate/leader machine
//! - [`log::Log`]: contract a replicated log must satisfy (plus an in-memory
//!   implementation)
//! - [`peer::Peer`]: one remote node, reachable for vote and heartbeat RPCs
//! - [`consensus::Consensus`]: the engine owning all of the above for one node
//! - [`node::RaftNode`]: timer scheduling and command interpretation
//! - [`cluster::LocalNetwork`]: in-process wiring for tests and simulations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod log;
pub mod node;
pub mod peer;
pub mod rpc;
pub mod state;
pub mod term;

use thiserror::Error;

/// Identifier of a cluster member. Unique per cluster, including self.
pub type NodeId = u64;

/// Position of an entry in the replicated log.
pub type LogIndex = u64;

/// Errors surfaced by the consensus core.
///
/// Protocol-level rejections (a denied vote, an unsuccessful append) are not
/// errors; they travel as ordinary response fields.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A term update was attempted with a term that is not newer than the
    /// current one. Callers violated the monotonicity precondition; state is
    /// left unchanged.
    #[error("proposed term {proposed} is not newer than current term {current}")]
    StaleTerm {
        /// The rejected term.
        proposed: term::TermId,
        /// The term the node currently holds.
        current: term::TermId,
    },

    /// The configuration failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A log operation failed.
    #[error(transparent)]
    Log(#[from] log::LogError),

    /// A peer RPC failed at the transport boundary.
    #[error(transparent)]
    Transport(#[from] peer::TransportError),
}

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, RaftError>;
