use std::net::SocketAddr;

use crate::net::Envelope;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First JOIN from an address the host had no peer for.
    PeerConnected {
        addr: SocketAddr,
    },
    PeerJoined {
        addr: SocketAddr,
        name: String,
    },
    PeerLeft {
        addr: SocketAddr,
        name: String,
        reason: DisconnectReason,
    },
    RosterChanged {
        names: Vec<String>,
    },
    /// An application envelope with no registered handler.
    Message {
        from: SocketAddr,
        sender: String,
        envelope: Envelope,
    },
    DeliveryLost {
        to: SocketAddr,
        envelope: Envelope,
    },
    /// Client role only. The session is closed once this is raised.
    HostLost {
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Left,
    TimedOut,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Left => "left",
            DisconnectReason::TimedOut => "timed out",
        }
    }
}
