//! src/transport/mod.rs
//!
//! The TCP transport: dialing, accepting, and framed peer sessions. The
//! manager never touches sockets; it sees one `PeerHandle` per peer and a
//! stream of `SessionEvent`s arriving on its inbox.

use crate::{
    domain::{Envelope, PeerDescriptor, PeerName},
    error::{Error, Result},
    manager::ManagerHandle,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_util::sync::CancellationToken;

pub mod session;

/// Capacity of a session's outbound envelope queue.
const OUTBOUND_QUEUE: usize = 64;

/// Events posted by transport sessions to the manager's inbox.
#[derive(Debug)]
pub enum SessionEvent {
    /// An outbound handshake completed; the remote pushed its membership.
    Connected {
        peer: PeerDescriptor,
        snapshot: Vec<u8>,
    },
    /// An envelope arrived from a peer, on either connection direction.
    Inbound { from: PeerName, envelope: Envelope },
    /// An outbound session terminated; its table entry must be dropped.
    Closed { peer: PeerName },
}

/// Everything that crosses the wire, length-delimited and bincode-encoded.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// The dialer introduces itself.
    Hello { from: PeerDescriptor },
    /// The acceptor answers with its identity and current membership.
    Welcome {
        from: PeerDescriptor,
        snapshot: Vec<u8>,
    },
    /// Application traffic.
    Envelope(Envelope),
}

/// A send-channel handle to one peer's outbound session.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    name: PeerName,
    tx: mpsc::Sender<Envelope>,
}

impl PeerHandle {
    pub fn new(name: PeerName, tx: mpsc::Sender<Envelope>) -> Self {
        Self { name, tx }
    }

    pub fn name(&self) -> &PeerName {
        &self.name
    }

    /// Fire-and-forget dispatch. Fails when the session has terminated or
    /// its queue is full; the manager never blocks on a slow peer.
    pub fn try_send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .try_send(envelope)
            .map_err(|_| Error::Disconnected(self.name.clone()))
    }
}

/// The seam between the manager and the network: starting an outbound
/// session to a peer.
///
/// `connect` must return within a bounded interval. The started session is
/// owned by the caller through the returned handle, posts `SessionEvent`s
/// to `events` for its whole lifetime, and posts `Closed` on termination.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerDescriptor,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<PeerHandle>;
}

/// Dials peers over plain TCP with a bounded timeout.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    local: PeerDescriptor,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(local: PeerDescriptor, timeout: Duration) -> Self {
        Self { local, timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        peer: &PeerDescriptor,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<PeerHandle> {
        let stream = time::timeout(self.timeout, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| Error::ConnectTimeout(peer.name.clone()))?
            .map_err(|source| Error::ConnectFailed {
                peer: peer.name.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(session::run_outbound(
            stream,
            self.local.clone(),
            peer.clone(),
            rx,
            events,
        ));
        Ok(PeerHandle::new(peer.name.clone(), tx))
    }
}

/// Accepts inbound peer connections and spawns a session per socket.
///
/// Inbound sessions only answer the handshake and forward envelopes; they
/// never appear in the connection table, which tracks outbound handles.
pub struct Listener {
    listener: TcpListener,
    local: PeerDescriptor,
    manager: ManagerHandle,
    events: mpsc::Sender<SessionEvent>,
}

impl Listener {
    pub async fn bind(
        bind_addr: SocketAddr,
        local: PeerDescriptor,
        manager: ManagerHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        Ok(Self {
            listener,
            local,
            manager,
            events,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The accept loop. Runs until the shutdown token fires.
    pub async fn run(self, shutdown_token: CancellationToken) {
        tracing::info!(node = %self.local.name, "Transport listener started");
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Transport listener received shutdown signal.");
                    break;
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let local = self.local.clone();
                            let manager = self.manager.clone();
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                session::run_inbound(stream, peer_addr, local, manager, events).await;
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, "Failed to accept inbound connection");
                        }
                    }
                }
            }
        }
    }
}

// --- Test Support ---
