//! Per-seed accounting: results, faults, the hosts working the seed, and peer liveness confirmations.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::key::Key;
use crate::protocol::Fault;

/// Something that happened to a seed, pushed to whoever originated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedEvent {
    Result(Bytes),
    Fault(Fault),
    /// A forwarding attempt for this seed was accepted by `host`.
    Accepted { instance: Key, host: SocketAddrV4 },
    /// Trace BEGIN: `host` started working `instance`.
    WorkerStarted { instance: Key, host: SocketAddrV4 },
    /// Trace END: `instance` finished.
    WorkerFinished { instance: Key },
    /// No candidate accepted a forwarding attempt for this seed.
    Abandoned { instance: Key },
}

#[derive(Default)]
struct SeedState {
    results: Vec<Bytes>,
    faults: Vec<Fault>,
    workers: HashMap<Key, SocketAddrV4>,
    confirmations: HashMap<SocketAddrV4, Instant>,
}

/// Accounting object for one seed. Results and faults may arrive interleaved in any order and
/// in any number.
pub struct SeedTracker {
    seed: Key,
    state: Mutex<SeedState>,
    events: Option<mpsc::UnboundedSender<SeedEvent>>,
}

impl SeedTracker {
    /// Tracker without an event stream (e.g. on a node that only forwards the seed).
    pub fn new(seed: Key) -> Self {
        Self {
            seed,
            state: Mutex::new(SeedState::default()),
            events: None,
        }
    }

    /// Tracker that also pushes every change to the returned receiver.
    pub fn with_events(seed: Key) -> (Self, mpsc::UnboundedReceiver<SeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            seed,
            state: Mutex::new(SeedState::default()),
            events: Some(tx),
        };
        (tracker, rx)
    }

    pub fn seed(&self) -> Key {
        self.seed
    }

    pub fn add_result(&self, data: Bytes) {
        self.state.lock().results.push(data.clone());
        self.emit(SeedEvent::Result(data));
    }

    pub fn add_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault.clone());
        self.emit(SeedEvent::Fault(fault));
    }

    /// Record that `host` is working `instance`. Returns false if it was already recorded.
    pub fn add_worker(&self, instance: Key, host: SocketAddrV4) -> bool {
        let fresh = self.state.lock().workers.insert(instance, host).is_none();
        if fresh {
            self.emit(SeedEvent::WorkerStarted { instance, host });
        }
        fresh
    }

    /// Forget `instance`. Returns the host that was working it, if any.
    pub fn remove_worker(&self, instance: &Key) -> Option<SocketAddrV4> {
        let host = self.state.lock().workers.remove(instance);
        if host.is_some() {
            self.emit(SeedEvent::WorkerFinished {
                instance: *instance,
            });
        }
        host
    }

    /// `peer` answered a ping saying it still has this seed outstanding.
    pub fn confirm_alive(&self, peer: SocketAddrV4) {
        self.state.lock().confirmations.insert(peer, Instant::now());
    }

    pub(crate) fn accepted(&self, instance: Key, host: SocketAddrV4) {
        self.emit(SeedEvent::Accepted { instance, host });
    }

    pub(crate) fn abandoned(&self, instance: Key) {
        self.emit(SeedEvent::Abandoned { instance });
    }

    pub fn results(&self) -> Vec<Bytes> {
        self.state.lock().results.clone()
    }

    /// Remove and return results collected so far.
    pub fn take_results(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().results)
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.state.lock().faults.clone()
    }

    /// Hosts currently working this seed, by instance.
    pub fn workers(&self) -> HashMap<Key, SocketAddrV4> {
        self.state.lock().workers.clone()
    }

    pub fn last_confirmed(&self, peer: &SocketAddrV4) -> Option<Instant> {
        self.state.lock().confirmations.get(peer).copied()
    }

    fn emit(&self, event: SeedEvent) {
        if let Some(tx) = &self.events {
            // Receiver dropped means the originator stopped listening; state is still kept.
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for SeedTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SeedTracker")
            .field("seed", &self.seed)
            .field("results", &st.results.len())
            .field("faults", &st.faults.len())
            .field("workers", &st.workers.len())
            .finish()
    }
}
