use std::fmt;

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_DATAGRAM_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5041_5254;
pub const DEFAULT_PORT: u16 = 54322;

/// Type tag of an envelope.
///
/// The first five variants are control traffic handled inside the session.
/// Everything else travels as [`MessageKind::Application`] and is forwarded
/// untouched to whoever registered for that tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Ack,
    Join,
    Leave,
    Roster,
    Application(String),
}

impl MessageKind {
    pub const PING: &'static str = "PING";
    pub const PONG: &'static str = "PONG";
    pub const ACK: &'static str = "ACK";
    pub const JOIN: &'static str = "JOIN";
    pub const LEAVE: &'static str = "LEAVE";
    pub const ROSTER: &'static str = "PLAYERLIST";

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            Self::PING => Self::Ping,
            Self::PONG => Self::Pong,
            Self::ACK => Self::Ack,
            Self::JOIN => Self::Join,
            Self::LEAVE => Self::Leave,
            Self::ROSTER => Self::Roster,
            other => Self::Application(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => Self::PING,
            Self::Pong => Self::PONG,
            Self::Ack => Self::ACK,
            Self::Join => Self::JOIN,
            Self::Leave => Self::LEAVE,
            Self::Roster => Self::ROSTER,
            Self::Application(tag) => tag,
        }
    }

    /// PING, PONG and ACK are never acknowledged. A pong already answers its
    /// ping, and acking an ack would never terminate.
    #[inline]
    pub fn requires_ack(&self) -> bool {
        !matches!(self, Self::Ping | Self::Pong | Self::Ack)
    }

    #[inline]
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("datagram of {0} bytes exceeds MTU")]
    TooLarge(usize),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
struct WireEnvelope {
    magic: u32,
    version: u32,
    id: u64,
    kind: String,
    payload: String,
}

/// One logical message. One envelope always travels in exactly one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u64,
    pub kind: MessageKind,
    pub payload: String,
}

impl Envelope {
    pub fn new(id: u64, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireEnvelope {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            id: self.id,
            kind: self.kind.as_str().to_string(),
            payload: self.payload.clone(),
        };

        let bytes = rkyv::to_bytes::<rancor::Error>(&wire)
            .map(|aligned| aligned.into_vec())
            .map_err(EnvelopeError::Serialize)?;

        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }

        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(EnvelopeError::TooLarge(data.len()));
        }

        // Receive buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let wire = rkyv::from_bytes::<WireEnvelope, rancor::Error>(&aligned)
            .map_err(EnvelopeError::Deserialize)?;

        if wire.magic != PROTOCOL_MAGIC {
            return Err(EnvelopeError::BadMagic(wire.magic));
        }
        if wire.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(wire.version));
        }

        Ok(Self {
            id: wire.id,
            kind: MessageKind::from_tag(&wire.kind),
            payload: wire.payload,
        })
    }
}

/// Hands out envelope ids for one node. Ids are shared by every peer the
/// node talks to and are never reused for the lifetime of the generator.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn envelope(&mut self, kind: MessageKind, payload: impl Into<String>) -> Envelope {
        Envelope::new(self.next_id(), kind, payload)
    }
}

/// Most ids one ACK envelope carries. A u64 prints as at most 20 digits, so a
/// full batch plus the envelope header stays well under `MAX_DATAGRAM_SIZE`.
pub const MAX_ACK_IDS: usize = 48;

pub fn encode_ack_payload(ids: &[u64]) -> String {
    // A slice of integers always serializes.
    serde_json::to_string(ids).unwrap_or_else(|_| String::from("[]"))
}

pub fn decode_ack_payload(payload: &str) -> Result<Vec<u64>, EnvelopeError> {
    serde_json::from_str(payload).map_err(|source| EnvelopeError::Payload {
        kind: MessageKind::ACK,
        source,
    })
}

pub fn encode_roster_payload(names: &[String]) -> String {
    serde_json::to_string(names).unwrap_or_else(|_| String::from("[]"))
}

pub fn decode_roster_payload(payload: &str) -> Result<Vec<String>, EnvelopeError> {
    serde_json::from_str(payload).map_err(|source| EnvelopeError::Payload {
        kind: MessageKind::ROSTER,
        source,
    })
}
