//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use crate::domain::{PeerDescriptor, PeerName};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The globally unique name this node advertises to the cluster.
    pub name: String,
    /// The address advertised in the self descriptor and bound for peers.
    pub peer_ip: IpAddr,
    /// The port advertised in the self descriptor and bound for peers.
    pub peer_port: u16,
    /// Root directory for persisted state. Unset disables persistence.
    pub data_dir: Option<PathBuf>,
    /// Period between gossip rounds, measured from the end of one round to
    /// the start of the next.
    pub gossip_interval_ms: u64,
    /// Number of peers pushed to per gossip round.
    pub fanout: usize,
    /// Upper bound on a single outbound connection attempt.
    pub connect_timeout_ms: u64,
    /// Peers to join at startup.
    pub bootstrap_peers: Vec<BootstrapPeer>,
}

/// A peer to join when the node starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl BootstrapPeer {
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(PeerName::new(&self.name), self.ip, self.port)
    }
}

impl Config {
    /// Loads configuration from `peerd.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("peerd.toml"))
            .merge(Env::prefixed("PEERD_"))
            .extract()
    }

    /// The descriptor this node advertises to the rest of the cluster.
    pub fn self_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(PeerName::new(&self.name), self.peer_ip, self.peer_port)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer_ip, self.peer_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "peerd".to_owned(),
            peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            peer_port: 9090,
            data_dir: None,
            gossip_interval_ms: 5000,
            fanout: 2,
            connect_timeout_ms: 1000,
            bootstrap_peers: Vec::new(),
        }
    }
}
