//! tests/common/harness.rs
//!
//! A test harness for creating and managing clusters of peerd nodes.
//! This module provides the building blocks for all integration tests,
//! abstracting away the boilerplate of:
//! - Creating temporary data directories and configuration for each node.
//! - Picking ephemeral ports so tests can run in parallel.
//! - Spawning nodes in the background and shutting them down gracefully.
//! - Waiting for the published cluster view to satisfy a predicate.

use anyhow::{Context, Result};
use peerd::{
    domain::{Envelope, PeerDescriptor, PeerName},
    App, Config, ManagerHandle,
};
use std::{
    collections::BTreeSet,
    net::TcpListener as StdTcpListener,
    path::PathBuf,
    time::Duration,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A handle to a running peerd node in a test environment.
pub struct TestNode {
    pub name: PeerName,
    pub descriptor: PeerDescriptor,
    pub handle: ManagerHandle,
    shutdown_token: CancellationToken,
    temp_dir: TempDir,
}

impl TestNode {
    /// Configures and spawns a new node with a fresh data directory on an
    /// ephemeral port.
    pub async fn spawn(name: &str) -> Result<Self> {
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let port = ephemeral_port()?;
        Self::spawn_at(name, port, temp_dir).await
    }

    async fn spawn_at(name: &str, port: u16, temp_dir: TempDir) -> Result<Self> {
        let config = Config {
            name: name.to_owned(),
            peer_ip: "127.0.0.1".parse().unwrap(),
            peer_port: port,
            data_dir: Some(temp_dir.path().to_path_buf()),
            gossip_interval_ms: 100,
            fanout: 2,
            connect_timeout_ms: 500,
            bootstrap_peers: Vec::new(),
        };
        let descriptor = config.self_descriptor();

        let app = App::new(config).context("Failed to create app")?;
        let shutdown_token = app.shutdown_token();
        let started = app.start().await.context("Failed to start node")?;
        info!(node = name, addr = %started.local_addr, "Spawned test node");

        Ok(Self {
            name: PeerName::from(name),
            descriptor,
            handle: started.handle.clone(),
            shutdown_token,
            temp_dir,
        })
    }

    /// Shuts the node down and restarts it on the same port with the same
    /// data directory, as a process restart would.
    pub async fn respawn(self) -> Result<Self> {
        self.shutdown_token.cancel();
        // Give the listener a moment to release the port.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let name = self.name.as_str().to_owned();
        let port = self.descriptor.port;
        Self::spawn_at(&name, port, self.temp_dir).await
    }

    /// The on-disk location of this node's persisted cluster state.
    pub fn state_file(&self) -> PathBuf {
        self.temp_dir
            .path()
            .join("peer_service")
            .join("cluster_state")
    }

    /// Waits until this node's published cluster view is exactly the given
    /// set of member names.
    pub async fn wait_for_members(&self, expected: &[&str], timeout: Duration) -> Result<()> {
        let want: BTreeSet<PeerName> = expected.iter().map(|name| PeerName::from(*name)).collect();
        let mut view = self.handle.subscribe();

        tokio::time::timeout(timeout, async {
            loop {
                if view.borrow_and_update().members == want {
                    return Ok(());
                }
                view.changed()
                    .await
                    .context("Manager closed while waiting for members")?;
            }
        })
        .await
        .with_context(|| format!("Timed out waiting for members {expected:?} on {}", self.name))?
    }

    /// Polls `send_message` until it succeeds, spanning gossip ticks so a
    /// reconnect in progress has time to complete.
    pub async fn wait_for_send(
        &self,
        peer: &PeerName,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                if self
                    .handle
                    .send_message(peer.clone(), envelope.clone())
                    .await
                    .is_ok()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .with_context(|| format!("Timed out waiting for {peer} to become reachable"))
    }

    /// Shuts down the node gracefully.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

fn ephemeral_port() -> Result<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
