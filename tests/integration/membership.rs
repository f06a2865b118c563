//! tests/integration/membership.rs
//!
//! End-to-end membership tests over real TCP: join propagation, multi-node
//! convergence through a middleman, and graceful departure.

use crate::common::harness::TestNode;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_two_node_join_converges() {
    let test_timeout = Duration::from_secs(10);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.expect("Failed to spawn node A");
        let node_b = TestNode::spawn("node-b").await.expect("Failed to spawn node B");

        // A node that has not joined anything only knows itself.
        node_a
            .wait_for_members(&["node-a"], Duration::from_secs(1))
            .await
            .expect("Node A should start alone");

        node_a
            .handle
            .join(node_b.descriptor.clone())
            .await
            .expect("Join failed");

        // Both sides converge on the two-node view.
        node_a
            .wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
            .await
            .expect("Node A should see both nodes");
        node_b
            .wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
            .await
            .expect("Node B should see both nodes");

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_three_nodes_converge_through_a_middleman() {
    // A knows B and C; B and C never talk to each other directly. Gossip
    // through A must still bring everyone to the same three-node view.
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();
        let node_c = TestNode::spawn("node-c").await.unwrap();

        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        node_a.handle.join(node_c.descriptor.clone()).await.unwrap();

        let all = ["node-a", "node-b", "node-c"];
        for node in [&node_a, &node_b, &node_c] {
            node.wait_for_members(&all, Duration::from_secs(10))
                .await
                .expect("Cluster should converge on all three nodes");
        }

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_leave_shrinks_the_cluster_and_removes_state() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();
        let node_c = TestNode::spawn("node-c").await.unwrap();

        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        node_a.handle.join(node_c.descriptor.clone()).await.unwrap();
        let all = ["node-a", "node-b", "node-c"];
        for node in [&node_a, &node_b, &node_c] {
            node.wait_for_members(&all, Duration::from_secs(10)).await.unwrap();
        }
        assert!(node_b.state_file().exists());

        tracing::info!("Cluster converged; node B is leaving...");
        node_b.handle.leave().await.expect("Leave failed");

        // The survivors converge on the two-node view and B's persisted
        // state is gone.
        node_a
            .wait_for_members(&["node-a", "node-c"], Duration::from_secs(10))
            .await
            .expect("Node A should drop the departed node");
        node_c
            .wait_for_members(&["node-a", "node-c"], Duration::from_secs(10))
            .await
            .expect("Node C should drop the departed node");
        assert!(!node_b.state_file().exists(), "Departed node must delete its state file");

        // B's manager terminated normally; its handle is now dead.
        assert!(node_b.handle.members().await.is_err());

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_leave_and_join_converge() {
    // While A leaves, B simultaneously joins C. The surviving nodes must
    // agree on {B, C}: the departure wins over stale observations of A and
    // the concurrent add of C survives.
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();
        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        for node in [&node_a, &node_b] {
            node.wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
                .await
                .unwrap();
        }

        let node_c = TestNode::spawn("node-c").await.unwrap();
        let (leave, join) = tokio::join!(
            node_a.handle.leave(),
            node_b.handle.join(node_c.descriptor.clone()),
        );
        leave.expect("Leave failed");
        join.expect("Join failed");

        node_b
            .wait_for_members(&["node-b", "node-c"], Duration::from_secs(10))
            .await
            .expect("Node B should converge on the surviving pair");
        node_c
            .wait_for_members(&["node-b", "node-c"], Duration::from_secs(10))
            .await
            .expect("Node C should converge on the surviving pair");

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_restarted_node_reloads_its_membership() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();
        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        for node in [&node_a, &node_b] {
            node.wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
                .await
                .unwrap();
        }

        tracing::info!("Restarting node B with its existing data directory...");
        let node_b = node_b.respawn().await.expect("Failed to respawn node B");

        // The view is restored from disk, before any gossip arrives.
        node_b
            .wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
            .await
            .expect("Restarted node should reload its persisted membership");

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}
