//! src/manager/connections.rs
//!
//! The connection table and the reconnection sweep that keeps it aligned
//! with the membership view.

use crate::{
    domain::{Envelope, PeerDescriptor, PeerName},
    error::{Error, Result},
    membership::Membership,
    transport::{Connector, PeerHandle, SessionEvent},
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// The state of a single peer in the connection table.
///
/// `Disconnected` is an explicit state, distinct from the name being
/// absent: absent means not yet attempted or just torn down, `Disconnected`
/// means known and currently unreachable.
#[derive(Debug)]
pub enum ConnectionEntry {
    Connected(PeerHandle),
    Disconnected,
}

/// Maps every current or pending peer to its connection state.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: HashMap<PeerName, ConnectionEntry>,
}

impl ConnectionTable {
    pub fn get(&self, name: &PeerName) -> Option<&ConnectionEntry> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: PeerName, entry: ConnectionEntry) {
        self.entries.insert(name, entry);
    }

    /// Erases an entry entirely, used when its session terminates. The next
    /// sweep reinserts the name as `Disconnected` and retries.
    pub fn remove(&mut self, name: &PeerName) -> Option<ConnectionEntry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &PeerName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_connected(&self, name: &PeerName) -> bool {
        matches!(self.entries.get(name), Some(ConnectionEntry::Connected(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatches an envelope to a peer, reporting exactly why it cannot.
    pub fn dispatch(&self, name: &PeerName, envelope: Envelope) -> Result<()> {
        match self.entries.get(name) {
            None => Err(Error::NotYetConnected(name.clone())),
            Some(ConnectionEntry::Disconnected) => Err(Error::Disconnected(name.clone())),
            Some(ConnectionEntry::Connected(handle)) => handle.try_send(envelope),
        }
    }

    /// Pushes an envelope to every live connection. Dead channels are
    /// skipped; their close signals arrive on the manager inbox shortly.
    pub fn broadcast(&self, envelope: &Envelope) {
        for entry in self.entries.values() {
            if let ConnectionEntry::Connected(handle) = entry {
                let _ = handle.try_send(envelope.clone());
            }
        }
    }
}

/// Realizes the invariant that every current or pending peer has a table
/// entry.
///
/// Absent and `Disconnected` names are dialed; a live connection is never
/// redialed, which keeps a flapping peer from causing connection storms. A
/// failed dial records `Disconnected` and is retried on the next sweep, not
/// reported to any caller.
pub async fn establish_connections(
    table: &mut ConnectionTable,
    connector: &dyn Connector,
    membership: &Membership,
    pending: &[PeerDescriptor],
    local: &PeerName,
    events: &mpsc::Sender<SessionEvent>,
) {
    // A peer appearing both in membership and in pending is processed once.
    let mut candidates: BTreeMap<PeerName, PeerDescriptor> = BTreeMap::new();
    for peer in membership.value().into_iter().chain(pending.iter().cloned()) {
        if peer.name != *local {
            candidates.entry(peer.name.clone()).or_insert(peer);
        }
    }

    for (name, peer) in candidates {
        if table.is_connected(&name) {
            continue;
        }
        match connector.connect(&peer, events.clone()).await {
            Ok(handle) => {
                tracing::debug!(peer = %name, "Connection established");
                table.insert(name, ConnectionEntry::Connected(handle));
            }
            Err(error) => {
                tracing::debug!(peer = %name, %error, "Connection attempt failed");
                table.insert(name, ConnectionEntry::Disconnected);
            }
        }
    }
}

// --- Unit Tests ---
