//! src/domain.rs
//!
//! Consolidates the core domain types shared across the crate: peer
//! identity, the CRDT replica identifier, the wire envelopes exchanged
//! between managers, and the cluster view published to subscribers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

// --- Peer Identity ---

/// The stable, globally unique identifier of a cluster node.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerName(String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Identifies a cluster node on the network: a stable name plus the address
/// and port it can currently be dialed on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub name: PeerName,
    pub addr: IpAddr,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn new(name: PeerName, addr: IpAddr, port: u16) -> Self {
        Self { name, addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

// Identity is carried by the name alone. Address and port are dialing
// information and may change when a node moves between hosts.
impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PeerDescriptor {}

impl PartialOrd for PeerDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.addr, self.port)
    }
}

// --- Replica Identity ---

/// The CRDT replica identifier for this process.
///
/// Derived once at startup from the node name and a strictly increasing
/// counter, so a restarted node tags its operations with a fresh replica id
/// even when its name is unchanged. It never appears on the wire on its
/// own; it travels embedded in CRDT operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId([u8; 20]);

impl ActorId {
    /// Mints the replica id for this process lifetime.
    pub fn generate(name: &PeerName) -> Self {
        let counter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_nanos();
        Self::derive(name, counter)
    }

    fn derive(name: &PeerName, counter: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_str().as_bytes());
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor::{}", hex::encode(&self.0[..4]))
    }
}

// --- Wire Envelopes ---

/// Messages exchanged between peer managers. The transport treats these as
/// opaque payload; both ends must agree on the encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// A full serialized membership snapshot, pushed by the gossip engine.
    ReceiveState(Vec<u8>),
    /// A request for the receiving manager to deliver `payload` to its
    /// local recipient registered under `target`.
    Forward { target: String, payload: Vec<u8> },
}

// --- Published Cluster View ---

/// A snapshot of the membership from this node's perspective, published to
/// application subscribers on every change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClusterView {
    pub local: PeerName,
    pub members: BTreeSet<PeerName>,
}

// --- Unit Tests ---
