//! Distributed query execution kernel.
//!
//! A node accepts queries from peers, runs them against registered query types and streams
//! results back to the originating client. Forwarding retries across replicas until some node
//! accepts. Transport-agnostic: the host supplies a [`Transport`] and feeds inbound frames to
//! [`Kernel::deliver`].

pub mod config;
pub mod forwarding;
pub mod handler;
pub mod kernel;
pub mod key;
pub mod load;
pub mod local;
pub mod membership;
pub mod protocol;
pub mod query_type;
pub mod tracker;
pub mod wire;
pub mod worklog;

#[cfg(test)]
mod test_support;

pub use config::KernelConfig;
pub use forwarding::ForwardingAttempt;
pub use kernel::{Kernel, KernelError, Submission, Transport};
pub use key::Key;
pub use load::{LoadSource, SystemLoad};
pub use local::{LocalNetwork, LocalTransport};
pub use membership::{Membership, StaticMembership};
pub use protocol::{Envelope, Fault, Message, MessageKind, Mode, Modes, Query, RejectCode, TraceCode};
pub use query_type::{QueryContext, QueryError, QueryType};
pub use tracker::{SeedEvent, SeedTracker};
pub use wire::{decode, encode, DecodeError, EncodeError, Frame, MAX_FRAME_LEN};
pub use worklog::{WorkState, Worklog};
