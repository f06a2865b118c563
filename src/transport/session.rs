//! src/transport/session.rs
//!
//! Per-connection session tasks. An outbound session owns the socket dialed
//! by the connector: it performs the handshake, then pumps envelopes in both
//! directions until either side goes away. An inbound session answers the
//! handshake with the local membership and forwards whatever arrives.

use crate::{
    domain::{Envelope, PeerDescriptor},
    error::{Error, Result},
    manager::ManagerHandle,
    transport::{Frame, SessionEvent},
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on waiting for the remote half of the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

fn split(stream: TcpStream) -> (FrameSink, FrameStream) {
    Framed::new(stream, LengthDelimitedCodec::new()).split()
}

async fn write_frame(sink: &mut FrameSink, frame: &Frame) -> Result<()> {
    let bytes = bincode::serialize(frame)?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Reads the next decodable frame. Frames that fail to decode are dropped
/// and logged; the framing boundary stays intact, so the session survives.
async fn next_frame(stream: &mut FrameStream) -> Result<Option<Frame>> {
    while let Some(bytes) = stream.next().await.transpose()? {
        match bincode::deserialize(&bytes) {
            Ok(frame) => return Ok(Some(frame)),
            Err(error) => tracing::warn!(%error, "Dropping undecodable frame"),
        }
    }
    Ok(None)
}

/// Drives an outbound connection for its whole lifetime. Always posts
/// `Closed` on the way out so the manager can drop the table entry.
pub(crate) async fn run_outbound(
    stream: TcpStream,
    local: PeerDescriptor,
    peer: PeerDescriptor,
    outbound: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<SessionEvent>,
) {
    let name = peer.name.clone();
    if let Err(error) = drive_outbound(stream, local, peer, outbound, &events).await {
        tracing::debug!(peer = %name, %error, "Peer session ended");
    }
    let _ = events.send(SessionEvent::Closed { peer: name }).await;
}

async fn drive_outbound(
    stream: TcpStream,
    local: PeerDescriptor,
    peer: PeerDescriptor,
    mut outbound: mpsc::Receiver<Envelope>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<()> {
    let (mut sink, mut frames) = split(stream);

    write_frame(&mut sink, &Frame::Hello { from: local }).await?;
    let welcome = time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut frames))
        .await
        .map_err(|_| Error::HandshakeFailed(peer.name.to_string()))??;
    let (remote, snapshot) = match welcome {
        Some(Frame::Welcome { from, snapshot }) => (from, snapshot),
        _ => return Err(Error::HandshakeFailed(peer.name.to_string())),
    };
    tracing::info!(peer = %remote, "Connected to peer");

    events
        .send(SessionEvent::Connected {
            peer: remote,
            snapshot,
        })
        .await
        .map_err(|_| Error::ManagerClosed)?;

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(envelope) => write_frame(&mut sink, &Frame::Envelope(envelope)).await?,
                // The manager dropped the handle; the entry was replaced.
                None => return Ok(()),
            },
            frame = next_frame(&mut frames) => match frame? {
                Some(Frame::Envelope(envelope)) => {
                    // A closed inbox is not fatal here: a departing manager
                    // may still have queued envelopes for us to flush.
                    let send = events
                        .send(SessionEvent::Inbound { from: peer.name.clone(), envelope })
                        .await;
                    if send.is_err() {
                        tracing::debug!(peer = %peer.name, "Manager closed; dropping inbound envelope");
                    }
                }
                Some(_) => {
                    tracing::warn!(peer = %peer.name, "Unexpected handshake frame on established session");
                }
                None => return Ok(()),
            },
        }
    }
}

/// Drives an accepted connection: answers the handshake with the current
/// local membership, then forwards inbound envelopes to the manager.
pub(crate) async fn run_inbound(
    stream: TcpStream,
    peer_addr: SocketAddr,
    local: PeerDescriptor,
    manager: ManagerHandle,
    events: mpsc::Sender<SessionEvent>,
) {
    if let Err(error) = drive_inbound(stream, peer_addr, local, manager, events).await {
        tracing::debug!(peer = %peer_addr, %error, "Inbound session ended");
    }
}

async fn drive_inbound(
    stream: TcpStream,
    peer_addr: SocketAddr,
    local: PeerDescriptor,
    manager: ManagerHandle,
    events: mpsc::Sender<SessionEvent>,
) -> Result<()> {
    let (mut sink, mut frames) = split(stream);

    let hello = time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut frames))
        .await
        .map_err(|_| Error::HandshakeFailed(peer_addr.to_string()))??;
    let remote = match hello {
        Some(Frame::Hello { from }) => from,
        _ => return Err(Error::HandshakeFailed(peer_addr.to_string())),
    };

    let snapshot = manager.local_state().await?.encode()?;
    write_frame(
        &mut sink,
        &Frame::Welcome {
            from: local,
            snapshot,
        },
    )
    .await?;
    tracing::info!(peer = %remote, "Accepted connection from peer");

    loop {
        match next_frame(&mut frames).await? {
            Some(Frame::Envelope(envelope)) => {
                events
                    .send(SessionEvent::Inbound {
                        from: remote.name.clone(),
                        envelope,
                    })
                    .await
                    .map_err(|_| Error::ManagerClosed)?;
            }
            Some(_) => {
                tracing::warn!(peer = %remote.name, "Unexpected handshake frame on established session");
            }
            None => return Ok(()),
        }
    }
}
