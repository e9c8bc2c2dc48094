//! In-process cluster wiring.
//!
//! [`LocalNetwork`] routes consensus RPCs between [`RaftNode`]s living in the
//! same process, which is all a test or a simulation needs: no sockets, no
//! serialization, and directed partitions to fake an unreliable network.
//!
//! Peers are resolved lazily by node id, so a cluster can be wired up before
//! every node exists:
//!
//! ```ignore
//! let network = LocalNetwork::shared();
//! let peers = vec![network.connect(1, 2), network.connect(1, 3)];
//! let node = RaftNode::new(Consensus::new(config, peers, log)?);
//! network.register(1, node.clone());
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::log::Log;
use crate::node::RaftNode;
use crate::peer::{Peer, PeerFuture, TransportError};
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::NodeId;

/// A shared in-process network of consensus nodes.
pub struct LocalNetwork<L: Log> {
    /// Registered nodes, addressable by id.
    nodes: DashMap<NodeId, RaftNode<L>>,
    /// Directed `(from, to)` pairs whose traffic is refused.
    partitions: RwLock<Vec<(NodeId, NodeId)>>,
}

impl<L: Log> LocalNetwork<L> {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            partitions: RwLock::new(Vec::new()),
        }
    }

    /// Creates an empty network behind an [`Arc`], ready for
    /// [`LocalNetwork::connect`].
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes a node reachable under its id.
    pub fn register(&self, id: NodeId, node: RaftNode<L>) {
        self.nodes.insert(id, node);
    }

    /// Looks up a registered node.
    pub fn node(&self, id: NodeId) -> Option<RaftNode<L>> {
        self.nodes.get(&id).map(|entry| entry.value().clone())
    }

    /// Builds the peer through which `origin` talks to `target`.
    pub fn connect(self: &Arc<Self>, origin: NodeId, target: NodeId) -> Arc<dyn Peer<L::Data>> {
        Arc::new(LocalPeer {
            origin,
            target,
            network: Arc::clone(self),
        })
    }

    /// Refuses traffic from `from` to `to` (one direction only).
    pub fn add_partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().push((from, to));
    }

    /// Refuses traffic between two nodes in both directions.
    pub fn add_partition_bidirectional(&self, first: NodeId, second: NodeId) {
        let mut partitions = self.partitions.write();
        partitions.push((first, second));
        partitions.push((second, first));
    }

    /// Restores traffic from `from` to `to`.
    pub fn remove_partition(&self, from: NodeId, to: NodeId) {
        self.partitions
            .write()
            .retain(|&(f, t)| f != from || t != to);
    }

    /// Removes every partition involving the given node.
    pub fn heal_node(&self, id: NodeId) {
        self.partitions
            .write()
            .retain(|&(f, t)| f != id && t != id);
    }

    /// Removes all partitions.
    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    /// True when traffic from `from` to `to` is currently refused.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitions
            .read()
            .iter()
            .any(|&(f, t)| f == from && t == to)
    }
}

impl<L: Log> Default for LocalNetwork<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Peer`] that delivers RPCs to another node in the same process.
pub struct LocalPeer<L: Log> {
    origin: NodeId,
    target: NodeId,
    network: Arc<LocalNetwork<L>>,
}

impl<L: Log> LocalPeer<L> {
    fn route(&self) -> Result<RaftNode<L>, TransportError> {
        if self.network.is_partitioned(self.origin, self.target) {
            return Err(TransportError::ConnectionFailed {
                node_id: self.target,
                reason: "partitioned".to_string(),
            });
        }
        self.network
            .node(self.target)
            .ok_or(TransportError::UnknownNode(self.target))
    }
}

impl<L: Log> Peer<L::Data> for LocalPeer<L> {
    fn id(&self) -> NodeId {
        self.target
    }

    fn request_vote(&self, request: VoteRequest) -> PeerFuture<'_, VoteResponse> {
        Box::pin(async move {
            let node = self.route()?;
            Ok(node.on_vote_request(request))
        })
    }

    fn send_heartbeat(
        &self,
        request: AppendEntriesRequest<L::Data>,
    ) -> PeerFuture<'_, AppendEntriesResponse> {
        Box::pin(async move {
            let node = self.route()?;
            Ok(node.on_append_entries(request).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use crate::config::RaftConfig;
    use crate::consensus::Consensus;
    use crate::log::MemoryLog;
    use crate::rpc::VoteType;

    use super::*;

    fn register_node(
        network: &Arc<LocalNetwork<MemoryLog<String>>>,
        id: NodeId,
    ) -> RaftNode<MemoryLog<String>> {
        let consensus = Consensus::with_rng(
            RaftConfig::new(id),
            Vec::new(),
            MemoryLog::new(),
            SmallRng::seed_from_u64(id),
        )
        .unwrap();
        let node = RaftNode::new(consensus);
        network.register(id, node.clone());
        node
    }

    fn vote_request(term_id: u64, candidate_id: NodeId) -> VoteRequest {
        VoteRequest {
            vote_type: VoteType::PreVote,
            term_id,
            candidate_id,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn test_routes_votes_between_nodes() {
        let network = LocalNetwork::shared();
        register_node(&network, 2);

        let peer = network.connect(1, 2);
        let response = peer.request_vote(vote_request(1, 1)).await.unwrap();

        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn test_unknown_target_fails() {
        let network: Arc<LocalNetwork<MemoryLog<String>>> = LocalNetwork::shared();
        let peer = network.connect(1, 9);

        let result = peer.request_vote(vote_request(1, 1)).await;
        assert!(matches!(result, Err(TransportError::UnknownNode(9))));
    }

    #[tokio::test]
    async fn test_partition_refuses_traffic() {
        let network = LocalNetwork::shared();
        register_node(&network, 2);
        network.add_partition(1, 2);

        let peer = network.connect(1, 2);
        let result = peer.request_vote(vote_request(1, 1)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed { node_id: 2, .. })
        ));

        // The reverse direction is unaffected
        assert!(!network.is_partitioned(2, 1));

        network.remove_partition(1, 2);
        let response = peer.request_vote(vote_request(1, 1)).await.unwrap();
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn test_heal_node_clears_all_its_partitions() {
        let network: Arc<LocalNetwork<MemoryLog<String>>> = LocalNetwork::shared();
        network.add_partition_bidirectional(1, 2);
        network.add_partition(3, 1);

        network.heal_node(1);

        assert!(!network.is_partitioned(1, 2));
        assert!(!network.is_partitioned(2, 1));
        assert!(!network.is_partitioned(3, 1));
    }

    #[tokio::test]
    async fn test_routes_heartbeats_between_nodes() {
        let network = LocalNetwork::shared();
        let follower = register_node(&network, 2);

        let peer = network.connect(1, 2);
        let response = peer
            .send_heartbeat(AppendEntriesRequest::heartbeat(0, 1, 0))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(follower.leader_id(), Some(1));
    }
}
