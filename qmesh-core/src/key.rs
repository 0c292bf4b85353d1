//! Restart-safe identifiers for queries, query instances and senders.

use std::fmt;
use std::net::SocketAddrV4;

/// Globally unique identifier: a per-boot counter value, the minting host and that host's boot time.
///
/// `id` alone is only unique within one boot of one host; `boot_time` tells apart ids that
/// get reused after the process restarts. Two keys are equal only when all three fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub id: i64,
    pub host: SocketAddrV4,
    pub boot_time: i64,
}

impl Key {
    pub fn new(id: i64, host: SocketAddrV4, boot_time: i64) -> Self {
        Self {
            id,
            host,
            boot_time,
        }
    }

    /// True if this key was minted by the node listening on `host` during its current boot.
    pub fn is_minted_by(&self, host: SocketAddrV4, boot_time: i64) -> bool {
        self.host == host && self.boot_time == boot_time
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.host, self.boot_time)
    }
}
