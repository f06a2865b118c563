//! tests/integration/messaging.rs
//!
//! End-to-end tests for application message dispatch: send errors, forward
//! delivery to registered recipients, and reconnection after a peer dies.

use crate::common::harness::TestNode;
use peerd::domain::{Envelope, PeerName};
use peerd::Error;
use std::time::Duration;
use test_log::test;

fn ping() -> Envelope {
    Envelope::Forward {
        target: "ping".to_owned(),
        payload: b"ping".to_vec(),
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_send_to_unknown_peer_is_rejected() {
    let node_a = TestNode::spawn("node-a").await.unwrap();

    let result = node_a
        .handle
        .send_message(PeerName::from("ghost"), ping())
        .await;

    assert!(matches!(result, Err(Error::NotYetConnected(_))));
    node_a.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_forwarded_message_reaches_remote_recipient() {
    let test_timeout = Duration::from_secs(10);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();

        // B registers an application recipient before the messages flow.
        let mut inbox = node_b
            .handle
            .register_recipient("echo-service")
            .await
            .expect("Failed to register recipient");

        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        for node in [&node_a, &node_b] {
            node.wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
                .await
                .unwrap();
        }

        node_a
            .handle
            .forward_message(node_b.name.clone(), "echo-service", b"hello over there".to_vec())
            .await
            .expect("Forward failed");

        let delivered = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Recipient channel closed");
        assert_eq!(delivered, b"hello over there".to_vec());

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_sends_fail_while_peer_is_down_and_recover_after_restart() {
    let test_timeout = Duration::from_secs(30);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("node-a").await.unwrap();
        let node_b = TestNode::spawn("node-b").await.unwrap();
        node_a.handle.join(node_b.descriptor.clone()).await.unwrap();
        for node in [&node_a, &node_b] {
            node.wait_for_members(&["node-a", "node-b"], Duration::from_secs(5))
                .await
                .unwrap();
        }
        let b_name = node_b.name.clone();
        node_a
            .wait_for_send(&b_name, ping(), Duration::from_secs(5))
            .await
            .expect("Send should succeed while B is up");

        tracing::info!("Killing node B...");
        node_b.shutdown();

        // Once the session close is observed and the reconnect sweep has
        // run, the entry is an explicit Disconnected and sends say so.
        let saw_disconnected = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match node_a.handle.send_message(b_name.clone(), ping()).await {
                    Err(Error::Disconnected(_)) => return,
                    _ => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await;
        assert!(
            saw_disconnected.is_ok(),
            "Sends should report the peer as disconnected while it is down"
        );

        tracing::info!("Restarting node B...");
        let node_b = node_b.respawn().await.expect("Failed to respawn node B");

        // The next gossip rounds redial B and sends start succeeding again.
        node_a
            .wait_for_send(&b_name, ping(), Duration::from_secs(10))
            .await
            .expect("Send should succeed again after B returns");

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}
