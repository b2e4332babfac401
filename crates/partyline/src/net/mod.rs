mod connection;
mod endpoint;
mod envelope;
mod inbox;
mod liveness;
mod simulator;
mod stats;
mod tracking;

pub use connection::{PeerConnection, PeerId, PeerRegistry, RegistryError};
pub use endpoint::{DatagramSink, NetworkEndpoint, UdpSender};
pub use envelope::{
    DEFAULT_PORT, Envelope, EnvelopeError, IdGenerator, MAX_ACK_IDS, MAX_DATAGRAM_SIZE, MessageKind,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, decode_ack_payload, decode_roster_payload,
    encode_ack_payload, encode_roster_payload,
};
pub use inbox::{Inbound, Inbox};
pub use liveness::{HeartbeatAction, HeartbeatSchedule, check_peer};
pub use simulator::{LossySink, PacketLossSimulation};
pub use stats::NetworkStats;
pub use tracking::{AckAccumulator, DedupWindow, PendingList, PendingMessage, RetryScan};
