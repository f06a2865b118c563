//! src/manager/mod.rs
//!
//! The membership manager actor. It is the single owner of the membership
//! CRDT, the pending-join list and the connection table; every external
//! operation arrives as a request on its inbox and handlers run one at a
//! time, which is the whole concurrency story: no locks, no shared state.

use crate::{
    config::Config,
    domain::{ActorId, ClusterView, Envelope, PeerDescriptor, PeerName},
    error::{Error, Result},
    manager::gossip::seeded_rng,
    membership::Membership,
    persistence::Store,
    transport::{Connector, SessionEvent},
};
use rand::rngs::StdRng;
use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub mod connections;
pub mod gossip;

pub use connections::{ConnectionEntry, ConnectionTable};

/// Inbox capacity for requests and session events.
const CHANNEL_CAPACITY: usize = 100;

/// Requests accepted by the manager, each carrying its reply channel.
#[derive(Debug)]
enum Request {
    Members(oneshot::Sender<Vec<PeerName>>),
    LocalState(oneshot::Sender<Membership>),
    GetActor(oneshot::Sender<ActorId>),
    Join(PeerDescriptor, oneshot::Sender<()>),
    Leave(oneshot::Sender<()>),
    UpdateState(Membership, oneshot::Sender<()>),
    DeleteState(oneshot::Sender<()>),
    SendMessage(PeerName, Envelope, oneshot::Sender<Result<()>>),
    ForwardMessage {
        via: PeerName,
        target: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterRecipient(String, mpsc::UnboundedSender<Vec<u8>>, oneshot::Sender<()>),
    UnregisterRecipient(String, oneshot::Sender<()>),
}

/// Cloneable client side of the manager actor. Every method is a
/// send-and-await on the manager's inbox; effects are observed in issue
/// order from any single caller.
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    requests: mpsc::Sender<Request>,
    view: watch::Receiver<ClusterView>,
}

impl ManagerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::ManagerClosed)?;
        reply_rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// The current set of member names.
    pub async fn members(&self) -> Result<Vec<PeerName>> {
        self.request(Request::Members).await
    }

    /// A by-value snapshot of the local membership CRDT.
    pub async fn local_state(&self) -> Result<Membership> {
        self.request(Request::LocalState).await
    }

    /// The replica id this process tags CRDT operations with.
    pub async fn actor_id(&self) -> Result<ActorId> {
        self.request(Request::GetActor).await
    }

    /// Adds a peer to the pending list and attempts a connection.
    pub async fn join(&self, peer: PeerDescriptor) -> Result<()> {
        self.request(|reply| Request::Join(peer, reply)).await
    }

    /// Removes the local node from the cluster, pushes the departure to
    /// connected peers, deletes persisted state, and terminates the
    /// manager normally.
    pub async fn leave(&self) -> Result<()> {
        self.request(Request::Leave).await
    }

    /// Merges a membership snapshot into the local state.
    pub async fn update_state(&self, snapshot: Membership) -> Result<()> {
        self.request(|reply| Request::UpdateState(snapshot, reply))
            .await
    }

    /// Removes the persisted state file; in-memory state is unchanged.
    pub async fn delete_state(&self) -> Result<()> {
        self.request(Request::DeleteState).await
    }

    /// Dispatches an envelope to a peer's connection.
    pub async fn send_message(&self, peer: PeerName, envelope: Envelope) -> Result<()> {
        self.request(|reply| Request::SendMessage(peer, envelope, reply))
            .await?
    }

    /// Wraps a payload as a forward envelope and dispatches it to `via`,
    /// asking the remote manager to deliver it to its recipient named
    /// `target`.
    pub async fn forward_message(
        &self,
        via: PeerName,
        target: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let target = target.into();
        self.request(|reply| Request::ForwardMessage {
            via,
            target,
            payload,
            reply,
        })
        .await?
    }

    /// Registers a local recipient for forwarded messages and returns the
    /// receiving end of its delivery channel.
    pub async fn register_recipient(
        &self,
        target: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let target = target.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(|reply| Request::RegisterRecipient(target, tx, reply))
            .await?;
        Ok(rx)
    }

    /// Removes a local recipient. Forwarded messages for `target` arriving
    /// afterwards are dropped; unregistering a name that was never
    /// registered is a no-op.
    pub async fn unregister_recipient(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| Request::UnregisterRecipient(target, reply))
            .await
    }

    /// Subscribes to the cluster view published on every membership change.
    pub fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.view.clone()
    }
}

/// The membership manager actor. It owns all state and drives the gossip
/// protocol from its own event loop.
pub struct Manager {
    local: PeerDescriptor,
    actor: ActorId,
    membership: Membership,
    pending: Vec<PeerDescriptor>,
    table: ConnectionTable,
    recipients: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    store: Store,
    connector: Arc<dyn Connector>,
    rng: StdRng,
    fanout: usize,
    gossip_interval: Duration,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    view_tx: watch::Sender<ClusterView>,
}

impl Manager {
    /// Creates the manager and its client handle. Loads persisted
    /// membership when available, otherwise seeds it with the local node
    /// under a freshly minted replica id.
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        store: Store,
    ) -> Result<(Self, ManagerHandle)> {
        let local = config.self_descriptor();
        let actor = ActorId::generate(&local.name);
        let startup_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_nanos();

        let membership = match store.load()? {
            Some(loaded) => {
                tracing::info!(members = loaded.len(), "Loaded persisted cluster state");
                loaded
            }
            None => {
                let seeded = Membership::seed(local.clone(), actor);
                if let Err(error) = store.save(&seeded) {
                    tracing::warn!(%error, "Failed to persist seeded cluster state");
                }
                seeded
            }
        };

        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (view_tx, view_rx) = watch::channel(ClusterView {
            local: local.name.clone(),
            members: membership.names(),
        });

        let manager = Self {
            rng: seeded_rng(actor, startup_nanos),
            actor,
            membership,
            pending: Vec::new(),
            table: ConnectionTable::default(),
            recipients: HashMap::new(),
            store,
            connector,
            fanout: config.fanout,
            gossip_interval: Duration::from_millis(config.gossip_interval_ms),
            requests: requests_rx,
            events: events_rx,
            events_tx,
            view_tx,
            local,
        };
        let handle = ManagerHandle {
            requests: requests_tx,
            view: view_rx,
        };
        Ok((manager, handle))
    }

    /// The sender handed to transport sessions so their events reach this
    /// manager's inbox.
    pub fn events_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// The serial event loop. Requests, session events and the gossip tick
    /// are interleaved but each handler runs to completion before the next.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(node = %self.local.name, actor = %self.actor, "Membership manager started");
        let mut gossip_timer = time::interval(self.gossip_interval);
        // Reschedule from the end of each handler, so ticks never overlap
        // and never bunch up after a slow round.
        gossip_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Membership manager received shutdown signal.");
                    break;
                },
                _ = gossip_timer.tick() => {
                    self.gossip().await;
                },
                Some(request) = self.requests.recv() => {
                    if self.handle_request(request).await.is_break() {
                        break;
                    }
                },
                Some(event) = self.events.recv() => {
                    self.handle_session_event(event).await;
                },
                else => {
                    tracing::info!("Channel closed. Membership manager shutting down.");
                    break;
                }
            }
        }
        tracing::info!(node = %self.local.name, "Membership manager stopped");
    }

    async fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::Members(reply) => {
                let _ = reply.send(self.membership.names().into_iter().collect());
            }
            Request::LocalState(reply) => {
                let _ = reply.send(self.membership.clone());
            }
            Request::GetActor(reply) => {
                let _ = reply.send(self.actor);
            }
            Request::Join(peer, reply) => {
                self.handle_join(peer).await;
                let _ = reply.send(());
            }
            Request::Leave(reply) => {
                self.handle_leave();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Request::UpdateState(snapshot, reply) => {
                self.handle_update_state(snapshot).await;
                let _ = reply.send(());
            }
            Request::DeleteState(reply) => {
                if let Err(error) = self.store.delete() {
                    tracing::warn!(%error, "Failed to delete persisted cluster state");
                }
                let _ = reply.send(());
            }
            Request::SendMessage(peer, envelope, reply) => {
                let _ = reply.send(self.table.dispatch(&peer, envelope));
            }
            Request::ForwardMessage {
                via,
                target,
                payload,
                reply,
            } => {
                let envelope = Envelope::Forward { target, payload };
                let _ = reply.send(self.table.dispatch(&via, envelope));
            }
            Request::RegisterRecipient(target, sender, reply) => {
                self.recipients.insert(target, sender);
                let _ = reply.send(());
            }
            Request::UnregisterRecipient(target, reply) => {
                self.recipients.remove(&target);
                let _ = reply.send(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { peer, snapshot } => {
                self.handle_connected(peer, snapshot).await;
            }
            SessionEvent::Closed { peer } => {
                // The entry becomes absent; the next sweep reinserts it as
                // Disconnected and retries.
                if self.table.remove(&peer).is_some() {
                    tracing::debug!(peer = %peer, "Peer session terminated");
                }
            }
            SessionEvent::Inbound { from, envelope } => {
                self.handle_envelope(from, envelope).await;
            }
        }
    }

    async fn handle_join(&mut self, peer: PeerDescriptor) {
        if peer.name == self.local.name {
            tracing::debug!("Ignoring join for the local node");
            return;
        }
        tracing::info!(peer = %peer, "Joining peer");
        self.pending.push(peer);
        self.establish_connections().await;
    }

    fn handle_leave(&mut self) {
        tracing::info!(node = %self.local.name, "Leaving the cluster");
        self.membership.remove(&self.local);
        match self.membership.encode() {
            // The node is about to terminate, so the departure goes to
            // every live connection rather than a fanout sample.
            Ok(snapshot) => self.table.broadcast(&Envelope::ReceiveState(snapshot)),
            Err(error) => tracing::error!(%error, "Failed to encode departure state"),
        }
        if let Err(error) = self.store.delete() {
            tracing::warn!(%error, "Failed to delete persisted cluster state");
        }
        self.publish_view();
    }

    /// A confirmation that an outbound handshake completed. Only peers we
    /// are waiting on mutate state: the remote snapshot also travels by
    /// gossip, and merging unsolicited handshake state would make every
    /// reconnect look like a join.
    async fn handle_connected(&mut self, peer: PeerDescriptor, snapshot: Vec<u8>) {
        let Some(position) = self.pending.iter().position(|p| p.name == peer.name) else {
            tracing::debug!(peer = %peer.name, "Reconnected to known peer");
            return;
        };
        let remote = match Membership::decode(&snapshot) {
            Ok(remote) => remote,
            Err(error) => {
                tracing::warn!(peer = %peer.name, %error, "Dropping undecodable membership snapshot");
                return;
            }
        };
        self.pending.remove(position);
        tracing::info!(peer = %peer.name, "Peer confirmed; merging remote membership");
        self.membership.merge(&remote);
        self.persist();
        self.publish_view();
        self.gossip().await;
    }

    async fn handle_envelope(&mut self, from: PeerName, envelope: Envelope) {
        match envelope {
            Envelope::ReceiveState(snapshot) => {
                self.handle_receive_state(from, snapshot).await;
            }
            Envelope::Forward { target, payload } => {
                match self.recipients.get(&target) {
                    Some(recipient) => {
                        if recipient.send(payload).is_err() {
                            tracing::warn!(recipient = %target, "Recipient handle dropped; unregistering");
                            self.recipients.remove(&target);
                        }
                    }
                    None => {
                        tracing::warn!(recipient = %target, from = %from, "No recipient registered for forwarded message");
                    }
                }
            }
        }
    }

    async fn handle_receive_state(&mut self, from: PeerName, snapshot: Vec<u8>) {
        let remote = match Membership::decode(&snapshot) {
            Ok(remote) => remote,
            Err(error) => {
                tracing::warn!(peer = %from, %error, "Dropping undecodable membership snapshot");
                return;
            }
        };
        if remote == self.membership {
            tracing::trace!(peer = %from, "Gossiped state already known");
            return;
        }
        tracing::debug!(peer = %from, "Merging gossiped membership");
        self.membership.merge(&remote);
        self.persist();
        self.publish_view();
        // Connections are established from the post-merge membership, so
        // peers first learned from this snapshot are dialed now rather
        // than one tick late.
        self.gossip().await;
    }

    async fn handle_update_state(&mut self, remote: Membership) {
        self.membership.merge(&remote);
        self.persist();
        self.publish_view();
        self.establish_connections().await;
    }

    /// One anti-entropy round: repair the connection table, then push the
    /// full local state to a random fanout-sized subset of peers. Dispatch
    /// failures are not retried; the next round heals them.
    async fn gossip(&mut self) {
        self.establish_connections().await;

        let members = self.membership.value();
        let targets = gossip::select_peers(&members, &self.local.name, self.fanout, &mut self.rng);
        if targets.is_empty() {
            return;
        }
        let snapshot = match self.membership.encode() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::error!(%error, "Failed to encode membership for gossip");
                return;
            }
        };
        for peer in targets {
            if let Err(error) = self
                .table
                .dispatch(&peer.name, Envelope::ReceiveState(snapshot.clone()))
            {
                tracing::debug!(peer = %peer.name, %error, "Gossip dispatch failed");
            }
        }
    }

    async fn establish_connections(&mut self) {
        connections::establish_connections(
            &mut self.table,
            self.connector.as_ref(),
            &self.membership,
            &self.pending,
            &self.local.name,
            &self.events_tx,
        )
        .await;
    }

    fn persist(&self) {
        if let Err(error) = self.store.save(&self.membership) {
            tracing::warn!(%error, "Failed to persist cluster state");
        }
    }

    fn publish_view(&self) {
        let _ = self.view_tx.send(ClusterView {
            local: self.local.name.clone(),
            members: self.membership.names(),
        });
    }
}

// --- Unit Tests ---
