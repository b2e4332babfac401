use std::io;
use std::net::SocketAddr;

use crate::config::ConfigError;
use crate::net::EnvelopeError;

/// Misuse of the send API. Lost datagrams and socket failures are never
/// reported here; they show up in the log and as session events.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session is closed")]
    Closed,
    #[error("not connected to a host")]
    NoHost,
    #[error("unknown peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("{0} is a reserved control kind")]
    ReservedKind(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open socket: {0}")]
    Io(#[from] io::Error),
}
