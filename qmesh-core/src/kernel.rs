//! Per-node orchestrator. Owns every piece of shared protocol state; handlers drive it.
//!
//! All maps sit behind their own mutex. Removal from the forwarding map and the Held -> Unheld
//! transition of a worklog are done under the lock, so exactly one caller wins each of them no
//! matter how many handlers and timers race.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::forwarding::ForwardingAttempt;
use crate::handler;
use crate::key::Key;
use crate::load::{LoadSource, SystemLoad};
use crate::membership::Membership;
use crate::protocol::{Envelope, Fault, Message, Modes, Query, TraceCode};
use crate::query_type::{QueryContext, QueryError, QueryType, QueryTypes};
use crate::tracker::{SeedEvent, SeedTracker};
use crate::wire::{self, Frame};
use crate::worklog::{WorkState, Worklog};

/// Outbound half of the network. Fire-and-forget: no delivery guarantee, never blocks.
pub trait Transport: Send + Sync {
    fn send(&self, to: SocketAddrV4, frame: Frame);
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel must be created inside a tokio runtime")]
    NoRuntime,
    #[error("listen address must name a concrete host and port, got {0}")]
    InvalidListen(SocketAddrV4),
}

/// Handle returned to the originator of a query.
#[derive(Debug)]
pub struct Submission {
    pub seed: Key,
    pub tracker: Arc<SeedTracker>,
    pub events: mpsc::UnboundedReceiver<SeedEvent>,
}

pub struct Kernel {
    listen: SocketAddrV4,
    boot_time: i64,
    config: KernelConfig,
    ids: AtomicI64,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    load: Arc<dyn LoadSource>,
    query_types: QueryTypes,
    /// Seeds this node originated or forwarded.
    trackers: Mutex<HashMap<Key, Arc<SeedTracker>>>,
    /// Received query instances not yet finished, keyed by instance.
    worklogs: Mutex<HashMap<Key, Worklog>>,
    killed: Mutex<HashSet<Key>>,
    /// Outstanding forwarding attempts, keyed by the instance currently in flight.
    forwarding: Mutex<HashMap<Key, ForwardingAttempt>>,
    handler_permits: Arc<Semaphore>,
    exec_permits: Arc<Semaphore>,
    runtime: Handle,
    this: Weak<Kernel>,
}

impl Kernel {
    /// Must be called from within a tokio runtime; timers and workers are spawned onto it.
    pub fn new(
        listen: SocketAddrV4,
        config: KernelConfig,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
    ) -> Result<Arc<Self>, KernelError> {
        Self::with_load_source(listen, config, transport, membership, Arc::new(SystemLoad::new()))
    }

    /// Like [`Kernel::new`] with a caller-supplied load reading for admission control.
    pub fn with_load_source(
        listen: SocketAddrV4,
        config: KernelConfig,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        load: Arc<dyn LoadSource>,
    ) -> Result<Arc<Self>, KernelError> {
        if listen.ip().is_unspecified() || listen.port() == 0 {
            return Err(KernelError::InvalidListen(listen));
        }
        let runtime = Handle::try_current().map_err(|_| KernelError::NoRuntime)?;
        let boot_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let workers = config.workers.max(1);
        info!(%listen, boot_time, workers, "kernel created");
        Ok(Arc::new_cyclic(|this| Self {
            listen,
            boot_time,
            config,
            ids: AtomicI64::new(0),
            transport,
            membership,
            load,
            query_types: QueryTypes::default(),
            trackers: Mutex::new(HashMap::new()),
            worklogs: Mutex::new(HashMap::new()),
            killed: Mutex::new(HashSet::new()),
            forwarding: Mutex::new(HashMap::new()),
            handler_permits: Arc::new(Semaphore::new(workers)),
            exec_permits: Arc::new(Semaphore::new(workers)),
            runtime,
            this: this.clone(),
        }))
    }

    pub fn listen(&self) -> SocketAddrV4 {
        self.listen
    }

    pub fn boot_time(&self) -> i64 {
        self.boot_time
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Mint a key unique across hosts and restarts.
    pub fn generate_key(&self) -> Key {
        Key::new(
            self.ids.fetch_add(1, Ordering::Relaxed),
            self.listen,
            self.boot_time,
        )
    }

    /// Key this node would have minted for seed id `id` during its current boot.
    pub fn local_key(&self, id: i64) -> Key {
        Key::new(id, self.listen, self.boot_time)
    }

    /// Register the code run for queries of type `id`. True if it replaced an earlier one.
    pub fn register_query_type(&self, id: i32, qt: impl QueryType) -> bool {
        self.query_types.register(id, Arc::new(qt)).is_some()
    }

    // Sending and receiving

    /// Fire-and-forget unicast. Messages addressed to this node are dispatched locally.
    pub fn send(&self, message: Message, to: SocketAddrV4) {
        if to == self.listen {
            debug!(kind = ?message.kind(), "local delivery");
            self.dispatch(Envelope {
                sender: self.listen,
                message,
            });
            return;
        }
        match wire::encode(&message, self.listen.port()) {
            Ok(frame) => {
                debug!(%to, kind = ?message.kind(), len = frame.len(), "sent");
                self.transport.send(to, frame);
            }
            Err(e) => warn!(%to, kind = ?message.kind(), error = %e, "dropping unencodable message"),
        }
    }

    /// Decode one inbound frame and dispatch it. Undecodable frames are logged and discarded.
    pub fn deliver(&self, frame: Bytes, remote_ip: Ipv4Addr) {
        match wire::decode(frame, remote_ip) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => warn!(%remote_ip, error = %e, "discarding undecodable message"),
        }
    }

    /// Run one handler for `envelope` on the bounded handler pool.
    pub fn dispatch(&self, envelope: Envelope) {
        let Some(kernel) = self.this.upgrade() else {
            return;
        };
        let permits = self.handler_permits.clone();
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            handler::handle(&kernel, envelope);
        });
    }

    /// Deliver frames from `inbound` until the channel closes.
    pub async fn run(&self, mut inbound: mpsc::Receiver<(Bytes, Ipv4Addr)>) {
        while let Some((frame, remote_ip)) = inbound.recv().await {
            self.deliver(frame, remote_ip);
        }
        debug!("inbound channel closed");
    }

    /// Stop taking new handler and execution work and drop every pending forwarding timer.
    pub fn shutdown(&self) {
        self.handler_permits.close();
        self.exec_permits.close();
        let pending: Vec<ForwardingAttempt> =
            self.forwarding.lock().drain().map(|(_, a)| a).collect();
        for mut a in pending {
            a.disarm();
        }
        info!(listen = %self.listen, "kernel shut down");
    }

    // Admission control

    pub fn is_seed_killed(&self, seed: &Key) -> bool {
        self.killed.lock().contains(seed)
    }

    /// Blacklist `seed` on this node. Messages already in flight are not recalled.
    pub fn kill_seed(&self, seed: Key) {
        if self.killed.lock().insert(seed) {
            info!(%seed, "seed killed");
        }
    }

    /// Local, advisory backpressure check: worklog size and system load per CPU.
    pub fn is_query_capacity_free(&self) -> bool {
        if self.worklogs.lock().len() >= self.config.max_queries {
            return false;
        }
        match self.load.load_per_cpu() {
            Some(load) if load >= self.config.max_load_per_cpu => {
                debug!(load, max = self.config.max_load_per_cpu, "load too high");
                false
            }
            _ => true,
        }
    }

    // Received queries

    /// Record a received query instance. Returns false if it was already recorded.
    pub fn register_query(&self, query: &Query) -> bool {
        match self.worklogs.lock().entry(query.instance) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Worklog::new(query.clone()));
                true
            }
        }
    }

    /// Pause a registered query until the client acknowledges the trace BEGIN.
    pub fn hold_query(&self, instance: &Key) -> bool {
        let held = self
            .worklogs
            .lock()
            .get_mut(instance)
            .map(Worklog::hold)
            .unwrap_or(false);
        if held {
            debug!(%instance, "held");
            let this = self.this.clone();
            let instance = *instance;
            let after = self.config.hold_timeout();
            self.runtime.spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(kernel) = this.upgrade() {
                    kernel.expire_hold(&instance);
                }
            });
        }
        held
    }

    /// Release a held query. `None` if it is not held (unknown, or someone else released it).
    pub fn unhold_query(&self, instance: &Key) -> Option<Query> {
        let mut worklogs = self.worklogs.lock();
        let wl = worklogs.get_mut(instance)?;
        if !wl.unhold() {
            return None;
        }
        debug!(%instance, "unheld");
        Some(wl.query().clone())
    }

    fn expire_hold(&self, instance: &Key) {
        let expired = {
            let mut worklogs = self.worklogs.lock();
            match worklogs.get(instance).map(Worklog::state) {
                Some(WorkState::Held) => worklogs.remove(instance),
                _ => None,
            }
        };
        if let Some(wl) = expired {
            warn!(%instance, "trace acknowledgment never arrived; dropping held query");
            // The client may have recorded us as a worker already.
            self.send_trace_end(wl.query());
        }
    }

    /// Hand a registered query to local execution. The only path by which a query runs.
    pub fn runqueue_query(&self, instance: &Key) {
        let query = {
            let mut worklogs = self.worklogs.lock();
            match worklogs.get_mut(instance) {
                Some(wl) => {
                    if !wl.runqueue() {
                        warn!(%instance, state = ?wl.state(), "query not runnable");
                        return;
                    }
                    wl.query().clone()
                }
                None => {
                    warn!(%instance, "runqueue for unknown query");
                    return;
                }
            }
        };
        let Some(kernel) = self.this.upgrade() else {
            return;
        };
        debug!(%instance, seed = %query.seed, "runqueued");
        let permits = self.exec_permits.clone();
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(instance = %query.instance, "shut down before start");
                kernel.finish_query(&query.instance);
                return;
            };
            kernel.execute(query).await;
        });
    }

    async fn execute(self: Arc<Self>, query: Query) {
        let instance = query.instance;
        if self.is_seed_killed(&query.seed) {
            debug!(%instance, seed = %query.seed, "seed killed before start");
            self.finish_query(&instance);
            return;
        }
        if let Some(wl) = self.worklogs.lock().get_mut(&instance) {
            wl.start();
        }
        let outcome = match self.query_types.get(query.query_type) {
            None => Err(QueryError::UnknownType(query.query_type)),
            Some(qt) => {
                let mut ctx = QueryContext::new(self.clone(), query.clone());
                let q = query.clone();
                tokio::task::spawn_blocking(move || qt.answer(&q, &mut ctx))
                    .await
                    .unwrap_or_else(|e| Err(QueryError::Failed(format!("query panicked: {e}"))))
            }
        };
        if let Err(e) = outcome {
            warn!(%instance, seed = %query.seed, error = %e, "query failed");
            self.send(
                Message::Fault(Fault {
                    seed: query.seed,
                    message: Some(e.to_string()),
                }),
                query.client(),
            );
        }
        self.finish_query(&instance);
    }

    /// Local completion or teardown: free the slot and, for traced queries, tell the client.
    pub fn finish_query(&self, instance: &Key) {
        let Some(wl) = self.worklogs.lock().remove(instance) else {
            return;
        };
        debug!(%instance, elapsed = ?wl.arrived_at().elapsed(), "finished");
        self.send_trace_end(wl.query());
    }

    fn send_trace_end(&self, q: &Query) {
        if q.is_tracing() {
            self.send(
                Message::Trace {
                    seed: q.seed,
                    instance: q.instance,
                    code: TraceCode::End,
                },
                q.client(),
            );
        }
    }

    /// Snapshot of one worklog entry.
    pub fn worklog(&self, instance: &Key) -> Option<Worklog> {
        self.worklogs.lock().get(instance).cloned()
    }

    pub fn worklog_count(&self) -> usize {
        self.worklogs.lock().len()
    }

    /// Seed ids of queries in the worklog whose seed was minted by `host`.
    pub fn outstanding_seed_ids(&self, host: SocketAddrV4) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .worklogs
            .lock()
            .values()
            .map(|wl| wl.query().seed)
            .filter(|seed| seed.host == host)
            .map(|seed| seed.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    // Forwarding

    /// Send the attempt's query to its next candidate under a fresh instance and arm the timeout.
    /// Abandons the attempt when no candidate is left or the send budget is spent.
    pub fn send_query(&self, mut attempt: ForwardingAttempt) {
        if self.is_seed_killed(&attempt.seed()) {
            debug!(seed = %attempt.seed(), "seed killed; not forwarding");
            self.settle_forwarding(&attempt.seed());
            return;
        }
        if attempt.tries() >= self.config.max_forward_attempts {
            self.abandon(attempt, "forwarding attempts exhausted");
            return;
        }
        let instance = self.generate_key();
        let Some(dest) = attempt.advance(instance) else {
            self.abandon(attempt, "no candidate left");
            return;
        };
        let query = attempt.query().clone();
        debug!(%instance, seed = %query.seed, %dest, tries = attempt.tries(), "forwarding");
        self.forwarding.lock().insert(instance, attempt);
        self.arm_forwarding_timeout(instance);
        self.send(Message::Query(query), dest);
    }

    fn arm_forwarding_timeout(&self, instance: Key) {
        let this = self.this.clone();
        let after = self.config.forward_timeout();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(kernel) = this.upgrade() {
                handler::on_forwarding_timeout(&kernel, instance);
            }
        });
        match self.forwarding.lock().get_mut(&instance) {
            Some(attempt) => attempt.arm(task.abort_handle()),
            // Already answered.
            None => task.abort(),
        }
    }

    /// Remove a pending attempt and stop its timer. `None` means too late: drop silently.
    pub fn cancel_forwarding_timeout(&self, instance: &Key) -> Option<ForwardingAttempt> {
        let mut attempt = self.forwarding.lock().remove(instance)?;
        attempt.disarm();
        Some(attempt)
    }

    /// Like `cancel_forwarding_timeout`, called from the timer itself.
    pub(crate) fn take_expired_forwarding(&self, instance: &Key) -> Option<ForwardingAttempt> {
        self.forwarding.lock().remove(instance)
    }

    pub fn pending_forwarding_count(&self) -> usize {
        self.forwarding.lock().len()
    }

    pub fn is_forwarding_pending(&self, instance: &Key) -> bool {
        self.forwarding.lock().contains_key(instance)
    }

    fn abandon(&self, attempt: ForwardingAttempt, reason: &str) {
        let seed = attempt.seed();
        warn!(%seed, tries = attempt.tries(), reason, "abandoning forwarding attempt");
        if let Some(tracker) = self.get_query_tracker(&seed) {
            tracker.abandoned(attempt.instance());
        }
        self.send(
            Message::Fault(Fault {
                seed,
                message: Some(format!("no candidate accepted query: {reason}")),
            }),
            seed.host,
        );
        self.settle_forwarding(&seed);
    }

    // Seeds

    /// Start a new query on the cluster, routed through membership.
    pub fn submit_query(
        &self,
        query_type: i32,
        node_id: Option<i64>,
        payload: Vec<Bytes>,
        modes: Modes,
    ) -> Submission {
        let candidates = self.membership.candidates(node_id);
        self.submit_to(query_type, node_id, payload, modes, candidates)
    }

    /// Start a new query on the cluster with an explicit candidate list.
    pub fn submit_to(
        &self,
        query_type: i32,
        node_id: Option<i64>,
        payload: Vec<Bytes>,
        modes: Modes,
        candidates: Vec<SocketAddrV4>,
    ) -> Submission {
        let seed = self.generate_key();
        let (tracker, events) = SeedTracker::with_events(seed);
        let tracker = Arc::new(tracker);
        self.trackers.lock().insert(seed, tracker.clone());
        info!(%seed, query_type, candidates = candidates.len(), "submitting query");
        let query = Query {
            seed,
            instance: seed,
            generation: 0,
            query_type,
            payload,
            modes,
            node_id,
        };
        self.send_query(ForwardingAttempt::new(query, candidates));
        Submission {
            seed,
            tracker,
            events,
        }
    }

    /// Continue `parent` on another partition: same seed, next generation, fresh instance.
    pub fn forward_query(&self, parent: &Query, node_id: Option<i64>, payload: Vec<Bytes>) {
        self.trackers
            .lock()
            .entry(parent.seed)
            .or_insert_with(|| Arc::new(SeedTracker::new(parent.seed)));
        let query = Query {
            seed: parent.seed,
            instance: parent.instance,
            generation: parent.generation.saturating_add(1),
            query_type: parent.query_type,
            payload,
            modes: parent.modes,
            node_id,
        };
        let candidates = self.membership.candidates(node_id);
        self.send_query(ForwardingAttempt::new(query, candidates));
    }

    /// `None` means the seed is unknown here.
    pub fn get_query_tracker(&self, seed: &Key) -> Option<Arc<SeedTracker>> {
        self.trackers.lock().get(seed).cloned()
    }

    /// Called when a forwarding attempt for `seed` ends (accepted, abandoned or killed).
    /// Reclaims the tracker of a seed minted elsewhere once nothing here forwards it.
    pub(crate) fn settle_forwarding(&self, seed: &Key) {
        if seed.is_minted_by(self.listen, self.boot_time) {
            return;
        }
        let pending = self.forwarding.lock().values().any(|a| a.seed() == *seed);
        if !pending && self.trackers.lock().remove(seed).is_some() {
            debug!(%seed, "relay tracker released");
        }
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.lock().len()
    }

    /// Stop tracking `seed`; later messages for it are treated as unsolicited.
    pub fn release_seed(&self, seed: &Key) -> Option<Arc<SeedTracker>> {
        self.trackers.lock().remove(seed)
    }

    // Liveness

    /// Ask `peer` which of this node's seeds it still has outstanding.
    pub fn ping(&self, peer: SocketAddrV4) {
        self.send(
            Message::Ping {
                client: self.generate_key(),
            },
            peer,
        );
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("listen", &self.listen)
            .field("boot_time", &self.boot_time)
            .finish_non_exhaustive()
    }
}
