//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's
//! configuration and manages the lifecycle of its concurrent services.

use crate::{
    config::Config,
    error::Result,
    manager::{Manager, ManagerHandle},
    persistence::Store,
    transport::{Listener, TcpConnector},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

/// A running node: its API handle plus the service tasks to join on
/// shutdown.
pub struct StartedNode {
    pub handle: ManagerHandle,
    pub local_addr: SocketAddr,
    manager_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl StartedNode {
    /// Awaits service termination, logging any task failure.
    pub async fn join(self) {
        if let Err(error) = self.manager_task.await {
            tracing::error!(?error, "Manager task failed");
        }
        if let Err(error) = self.listener_task.await {
            tracing::error!(?error, "Listener task failed");
        }
    }
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The token that terminates all of this node's services.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts all services and returns the handle used to drive the node.
    ///
    /// This performs the following steps:
    ///   1. Builds the manager with its persisted (or seeded) membership.
    ///   2. Binds the peer listener on the advertised endpoint.
    ///   3. Spawns the manager and the accept loop as Tokio tasks.
    ///   4. Joins any configured bootstrap peers.
    pub async fn start(&self) -> Result<StartedNode> {
        let local = self.config.self_descriptor();
        let store = Store::new(self.config.data_dir.as_deref());
        let connector = Arc::new(TcpConnector::new(
            local.clone(),
            Duration::from_millis(self.config.connect_timeout_ms),
        ));

        let (manager, handle) = Manager::new(&self.config, connector, store)?;
        let events = manager.events_sender();

        let listener = Listener::bind(
            self.config.bind_addr(),
            local.clone(),
            handle.clone(),
            events,
        )
        .await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            node = %local.name,
            listen_addr = %local_addr,
            "🚀 Starting node..."
        );

        let listener_task = tokio::spawn(listener.run(self.shutdown_token.clone()));
        tracing::debug!("Transport listener spawned.");
        let manager_task = tokio::spawn(manager.run(self.shutdown_token.clone()));
        tracing::debug!("Manager spawned.");

        for bootstrap in &self.config.bootstrap_peers {
            handle.join(bootstrap.descriptor()).await?;
        }

        Ok(StartedNode {
            handle,
            local_addr,
            manager_task,
            listener_task,
        })
    }

    /// The main run loop for the binary: start services, then wait for a
    /// shutdown signal (like Ctrl+C) and terminate all tasks gracefully.
    pub async fn run(self) -> Result<()> {
        let node = self.start().await?;

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;
        node.join().await;
        tracing::info!("👋 Node has shut down gracefully.");

        Ok(())
    }
}
