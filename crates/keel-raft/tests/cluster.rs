//! End-to-end election behavior on an in-process cluster.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::time;

use keel_raft::cluster::LocalNetwork;
use keel_raft::config::RaftConfig;
use keel_raft::consensus::Consensus;
use keel_raft::log::MemoryLog;
use keel_raft::node::RaftNode;
use keel_raft::NodeId;

type ClusterLog = MemoryLog<String>;

fn build_cluster(
    network: &Arc<LocalNetwork<ClusterLog>>,
    ids: &[NodeId],
) -> Vec<RaftNode<ClusterLog>> {
    ids.iter()
        .map(|&id| {
            let peers = ids
                .iter()
                .filter(|&&peer| peer != id)
                .map(|&peer| network.connect(id, peer))
                .collect();

            let mut config = RaftConfig::new(id);
            config.election_timeout = Duration::from_millis(200);
            config.heartbeat_period = Duration::from_millis(50);
            config.vote_rpc_timeout = Duration::from_millis(25);
            config.append_rpc_timeout = Duration::from_millis(25);

            let consensus = Consensus::with_rng(
                config,
                peers,
                MemoryLog::new(),
                SmallRng::seed_from_u64(id),
            )
            .unwrap();

            let node = RaftNode::new(consensus);
            network.register(id, node.clone());
            node
        })
        .collect()
}

async fn wait_for_leader(nodes: &[RaftNode<ClusterLog>]) -> RaftNode<ClusterLog> {
    time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(leader) = nodes.iter().find(|node| node.is_leader()) {
                return leader.clone();
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a leader should emerge")
}

#[tokio::test(start_paused = true)]
async fn three_node_cluster_elects_one_leader() {
    let network = LocalNetwork::shared();
    let nodes = build_cluster(&network, &[1, 2, 3]);
    for node in &nodes {
        node.start();
    }

    let leader = wait_for_leader(&nodes).await;

    let leaders = nodes.iter().filter(|node| node.is_leader()).count();
    assert_eq!(leaders, 1);
    assert!(leader.current_term() >= 1);

    // A few heartbeat periods later every follower knows the leader
    time::sleep(Duration::from_secs(2)).await;
    for node in nodes.iter().filter(|node| !node.is_leader()) {
        assert_eq!(node.leader_id(), Some(leader.node_id()));
        assert_eq!(node.current_term(), leader.current_term());
    }

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn partitioned_leader_is_deposed_after_heal() {
    let network = LocalNetwork::shared();
    let nodes = build_cluster(&network, &[1, 2, 3]);
    for node in &nodes {
        node.start();
    }

    let old_leader = wait_for_leader(&nodes).await;
    let old_term = old_leader.current_term();

    // Cut the leader off from both followers
    for node in nodes.iter().filter(|node| node.node_id() != old_leader.node_id()) {
        network.add_partition_bidirectional(old_leader.node_id(), node.node_id());
    }

    // The majority side elects a replacement in a higher term
    let minority_id = old_leader.node_id();
    let majority: Vec<_> = nodes
        .iter()
        .filter(|node| node.node_id() != minority_id)
        .cloned()
        .collect();
    let new_leader = time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(leader) = majority.iter().find(|node| node.is_leader()) {
                return leader.clone();
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the majority should elect a new leader");
    assert!(new_leader.current_term() > old_term);

    // After healing, the old leader steps down on the first higher-term
    // heartbeat it receives
    network.heal_node(minority_id);
    time::timeout(Duration::from_secs(30), async {
        while old_leader.is_leader() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the stale leader should step down");

    assert_eq!(old_leader.current_term(), new_leader.current_term());
    assert_eq!(nodes.iter().filter(|node| node.is_leader()).count(), 1);

    for node in &nodes {
        node.shutdown();
    }
}
