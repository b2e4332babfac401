//! Reliable-enough messaging for LAN party games over plain UDP.
//!
//! One host, a handful of clients, string-tagged envelopes. Messages that
//! matter are acknowledged and retransmitted a bounded number of times,
//! duplicates are filtered, and silent peers are dropped by heartbeat.
//! Everything runs on the caller's tick except the socket read loop.

pub mod config;
pub mod net;
pub mod session;

pub use config::{ConfigError, TransportConfig};
pub use net::{
    DEFAULT_PORT, DatagramSink, Envelope, EnvelopeError, Inbox, MessageKind, NetworkStats,
    PeerConnection, PeerId,
};
pub use session::{
    Delivery, DisconnectReason, HandlerRegistry, MessageHandler, Role, SendError, Session,
    SessionError, SessionEvent,
};
