//! Peer abstraction.
//!
//! A [`Peer`] is one remote cluster member as seen from the local consensus
//! engine: something that can be asked for a vote or sent a heartbeat. The
//! transport layer (gRPC, TCP, in-process) provides the implementation; the
//! engine never learns how the bytes move.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::log::LogData;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::NodeId;

/// Errors surfaced by peer transports.
///
/// Inside a vote or heartbeat fan-out these are folded into "no grant" /
/// "unsuccessful" outcomes and never escalate further.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("connection failed to node {node_id}: {reason}")]
    ConnectionFailed {
        /// The target node id.
        node_id: NodeId,
        /// The reason for failure.
        reason: String,
    },

    /// No route to the given node id is known.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The call did not complete within the transport's own deadline.
    #[error("timeout")]
    Timeout,

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Result type for peer RPCs.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A boxed future returned by peer RPCs.
pub type PeerFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// One remote cluster member, reachable for consensus RPCs.
///
/// Implementations perform the actual network call and may enforce their own
/// deadlines; the engine additionally bounds every call with the timeouts
/// from its configuration.
pub trait Peer<D: LogData>: Send + Sync {
    /// Identifier of the remote node.
    fn id(&self) -> NodeId;

    /// Asks the peer for a (pre-)vote.
    fn request_vote(&self, request: VoteRequest) -> PeerFuture<'_, VoteResponse>;

    /// Sends an append-entries call; with no entries this is a heartbeat.
    fn send_heartbeat(
        &self,
        request: AppendEntriesRequest<D>,
    ) -> PeerFuture<'_, AppendEntriesResponse>;
}

/// Number of affirmative responses, including the local node's own, needed to
/// make a binding cluster decision.
///
/// Computed over the peer list; the self-vote is pre-seeded by the caller. A
/// node with two peers therefore needs `2/2 + 1 = 2` total grants, and a node
/// with no peers wins on its own vote alone.
pub fn quorum_size<D: LogData>(peers: &[Arc<dyn Peer<D>>]) -> usize {
    peers.len() / 2 + 1
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::rpc::VoteType;

    struct SilentPeer(NodeId);

    impl Peer<Bytes> for SilentPeer {
        fn id(&self) -> NodeId {
            self.0
        }

        fn request_vote(&self, request: VoteRequest) -> PeerFuture<'_, VoteResponse> {
            Box::pin(async move {
                Ok(VoteResponse::deny(request.vote_type, request.term_id))
            })
        }

        fn send_heartbeat(
            &self,
            request: AppendEntriesRequest<Bytes>,
        ) -> PeerFuture<'_, AppendEntriesResponse> {
            Box::pin(async move {
                Ok(AppendEntriesResponse {
                    term_id: request.term_id,
                    success: true,
                })
            })
        }
    }

    fn peers(count: usize) -> Vec<Arc<dyn Peer<Bytes>>> {
        (0..count)
            .map(|id| Arc::new(SilentPeer(id as NodeId)) as Arc<dyn Peer<Bytes>>)
            .collect()
    }

    #[test]
    fn test_quorum_size() {
        // Single-node cluster: the self-vote alone wins
        assert_eq!(quorum_size(&peers(0)), 1);
        // Two-node cluster: one total grant suffices
        assert_eq!(quorum_size(&peers(1)), 1);
        // Three-node cluster: self plus one peer
        assert_eq!(quorum_size(&peers(2)), 2);
        assert_eq!(quorum_size(&peers(3)), 2);
        assert_eq!(quorum_size(&peers(4)), 3);
        assert_eq!(quorum_size(&peers(6)), 4);
    }

    #[tokio::test]
    async fn test_peer_object_safety() {
        let peer: Arc<dyn Peer<Bytes>> = Arc::new(SilentPeer(3));
        let response = peer
            .request_vote(VoteRequest {
                vote_type: VoteType::PreVote,
                term_id: 1,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(peer.id(), 3);
    }
}
