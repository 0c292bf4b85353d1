//! One outstanding "send this query to a candidate node" attempt.
//!
//! Destinations are tried round-robin over the candidate list, starting at a random offset so
//! concurrent originators spread over replicas. A BLACKLIST rejection removes that destination
//! for the rest of the attempt; BUSY rejections and timeouts keep it in rotation.

use std::net::SocketAddrV4;

use rand::Rng;
use tokio::task::AbortHandle;

use crate::key::Key;
use crate::protocol::Query;

#[derive(Debug)]
pub struct ForwardingAttempt {
    query: Query,
    candidates: Vec<SocketAddrV4>,
    cursor: usize,
    destination: Option<SocketAddrV4>,
    tries: u32,
    timer: Option<AbortHandle>,
}

impl ForwardingAttempt {
    pub fn new(query: Query, candidates: Vec<SocketAddrV4>) -> Self {
        let start = if candidates.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..candidates.len())
        };
        Self::starting_at(query, candidates, start)
    }

    /// Like [`ForwardingAttempt::new`] with a fixed first candidate index.
    pub fn starting_at(query: Query, candidates: Vec<SocketAddrV4>, start: usize) -> Self {
        let cursor = if candidates.is_empty() {
            0
        } else {
            start % candidates.len()
        };
        Self {
            query,
            candidates,
            cursor,
            destination: None,
            tries: 0,
            timer: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Instance key of the send currently in flight.
    pub fn instance(&self) -> Key {
        self.query.instance
    }

    pub fn seed(&self) -> Key {
        self.query.seed
    }

    /// Destination of the send currently in flight.
    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.destination
    }

    pub fn candidates(&self) -> &[SocketAddrV4] {
        &self.candidates
    }

    /// Number of sends issued so far.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Move to the next destination under a fresh instance key. `None` when no candidate is left.
    pub(crate) fn advance(&mut self, instance: Key) -> Option<SocketAddrV4> {
        if self.candidates.is_empty() {
            self.destination = None;
            return None;
        }
        let dest = self.candidates[self.cursor];
        self.cursor = (self.cursor + 1) % self.candidates.len();
        self.destination = Some(dest);
        self.query.instance = instance;
        self.tries += 1;
        Some(dest)
    }

    /// Never try `dest` again in this attempt.
    pub(crate) fn exclude(&mut self, dest: SocketAddrV4) {
        let Some(pos) = self.candidates.iter().position(|c| *c == dest) else {
            return;
        };
        self.candidates.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.candidates.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.candidates.len();
        }
    }

    pub(crate) fn arm(&mut self, timer: AbortHandle) {
        if let Some(old) = self.timer.replace(timer) {
            old.abort();
        }
    }

    /// Stop the pending timeout, if any.
    pub(crate) fn disarm(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}
