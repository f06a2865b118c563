//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use crate::domain::PeerName;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("No connection has been attempted to peer {0}")]
    NotYetConnected(PeerName),

    #[error("Peer {0} is disconnected")]
    Disconnected(PeerName),

    #[error("Failed to connect to peer {peer}: {source}")]
    ConnectFailed {
        peer: PeerName,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection attempt to peer {0} timed out")]
    ConnectTimeout(PeerName),

    #[error("Handshake with {0} failed")]
    HandshakeFailed(String),

    #[error("The membership manager has shut down")]
    ManagerClosed,

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
