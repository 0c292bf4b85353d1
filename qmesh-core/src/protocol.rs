//! Protocol message types. Encoding is the hand-laid binary format in the wire module.

use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::key::Key;

/// Per-query execution flags. Each mode owns one reserved bit in the wire bitset, indexed by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Worker confirms execution start/end with the client via the trace exchange.
    Tracing,
}

impl Mode {
    pub const ALL: [Mode; 1] = [Mode::Tracing];

    pub fn ordinal(self) -> u8 {
        match self {
            Mode::Tracing => 0,
        }
    }

    /// Bit occupied by this mode in the encoded bitset.
    pub fn bit(self) -> u8 {
        2 << self.ordinal()
    }
}

/// Set of [`Mode`]s carried by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modes(u8);

impl Modes {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, mode: Mode) -> Self {
        self.insert(mode);
        self
    }

    pub fn insert(&mut self, mode: Mode) {
        self.0 |= mode.bit();
    }

    pub fn contains(&self, mode: Mode) -> bool {
        self.0 & mode.bit() != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Keep only bits belonging to known modes; anything else is reserved for later versions.
    pub fn from_bits(bits: u8) -> Self {
        let known = Mode::ALL.iter().fold(0u8, |acc, m| acc | m.bit());
        Self(bits & known)
    }
}

/// A query on its way to (or running on) some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Identity of the logical query; unchanged across forwarding hops.
    pub seed: Key,
    /// Identity of this particular send attempt; minted by the forwarder.
    pub instance: Key,
    pub generation: i32,
    pub query_type: i32,
    /// Scatter/gather payload buffers.
    pub payload: Vec<Bytes>,
    pub modes: Modes,
    /// Pins execution to one partition; `None` means any capable node.
    pub node_id: Option<i64>,
}

impl Query {
    pub fn is_tracing(&self) -> bool {
        self.modes.contains(Mode::Tracing)
    }

    /// Node that originated the seed; results, faults and traces go here.
    pub fn client(&self) -> SocketAddrV4 {
        self.seed.host
    }

    /// Node that sent this instance; Accept/Reject go here.
    pub fn forwarder(&self) -> SocketAddrV4 {
        self.instance.host
    }

    /// Total payload length across all buffers.
    pub fn payload_len(&self) -> usize {
        self.payload.iter().map(Bytes::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    /// The seed is killed on the rejecting node. Authoritative: do not retry that destination.
    Blacklist,
    /// The rejecting node is momentarily out of capacity.
    Busy,
}

impl RejectCode {
    pub fn to_byte(self) -> u8 {
        match self {
            RejectCode::Blacklist => 0,
            RejectCode::Busy => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RejectCode::Blacklist),
            1 => Some(RejectCode::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCode {
    Begin,
    End,
    Ok,
}

impl TraceCode {
    pub fn ordinal(self) -> i32 {
        match self {
            TraceCode::Begin => 0,
            TraceCode::End => 1,
            TraceCode::Ok => 2,
        }
    }

    pub fn from_ordinal(v: i32) -> Option<Self> {
        match v {
            0 => Some(TraceCode::Begin),
            1 => Some(TraceCode::End),
            2 => Some(TraceCode::Ok),
            _ => None,
        }
    }
}

/// Execution-time error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub seed: Key,
    /// Null on the wire is allowed.
    pub message: Option<String>,
}

/// All wire message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Positive admission response for one query instance.
    Accept { instance: Key },
    /// Negative admission response.
    Reject { instance: Key, code: RejectCode },
    Fault(Fault),
    /// Liveness check. `client` is a key minted by the sender.
    Ping { client: Key },
    /// Reply to a ping: ids of the sender's seeds this node still works on.
    Pong { key: Key, query_key_ids: Vec<i64> },
    Query(Query),
    /// Partial or complete result payload.
    Result { seed: Key, data: Vec<Bytes> },
    Trace {
        seed: Key,
        instance: Key,
        code: TraceCode,
    },
}

/// Message type tag, the first byte of every encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Accept = 0,
    Reject = 1,
    Fault = 2,
    Ping = 3,
    Pong = 4,
    Query = 5,
    Result = 6,
    Trace = 7,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => MessageKind::Accept,
            1 => MessageKind::Reject,
            2 => MessageKind::Fault,
            3 => MessageKind::Ping,
            4 => MessageKind::Pong,
            5 => MessageKind::Query,
            6 => MessageKind::Result,
            7 => MessageKind::Trace,
            _ => return None,
        })
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Accept { .. } => MessageKind::Accept,
            Message::Reject { .. } => MessageKind::Reject,
            Message::Fault(_) => MessageKind::Fault,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Query(_) => MessageKind::Query,
            Message::Result { .. } => MessageKind::Result,
            Message::Trace { .. } => MessageKind::Trace,
        }
    }
}

/// A decoded message plus the address its sender expects replies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: SocketAddrV4,
    pub message: Message,
}
