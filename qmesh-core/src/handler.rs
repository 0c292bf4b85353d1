//! One handler per message kind. Each runs as an independent unit of work and never waits on
//! another handler; anything unexpected (late, duplicate, unknown seed) is logged and dropped.

use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::forwarding::ForwardingAttempt;
use crate::kernel::Kernel;
use crate::key::Key;
use crate::protocol::{Envelope, Fault, Message, Query, RejectCode, TraceCode};
use crate::wire;

pub fn handle(kernel: &Kernel, envelope: Envelope) {
    let Envelope { sender, message } = envelope;
    match message {
        Message::Accept { instance } => on_accept(kernel, sender, instance),
        Message::Reject { instance, code } => on_reject(kernel, sender, instance, code),
        Message::Fault(fault) => on_fault(kernel, sender, fault),
        Message::Ping { client } => on_ping(kernel, sender, client),
        Message::Pong { key, query_key_ids } => on_pong(kernel, sender, key, &query_key_ids),
        Message::Query(query) => on_query(kernel, sender, query),
        Message::Result { seed, data } => on_result(kernel, sender, seed, data),
        Message::Trace {
            seed,
            instance,
            code,
        } => on_trace(kernel, sender, seed, instance, code),
    }
}

/// Admission control for a received query.
pub fn on_query(kernel: &Kernel, sender: SocketAddrV4, query: Query) {
    let instance = query.instance;
    let forwarder = query.forwarder();
    if kernel.is_seed_killed(&query.seed) {
        debug!(%instance, %sender, "rejecting query for killed seed");
        kernel.send(
            Message::Reject {
                instance,
                code: RejectCode::Blacklist,
            },
            forwarder,
        );
        return;
    }
    if !kernel.is_query_capacity_free() {
        debug!(%instance, %sender, "rejecting query: busy");
        kernel.send(
            Message::Reject {
                instance,
                code: RejectCode::Busy,
            },
            forwarder,
        );
        return;
    }
    if !kernel.register_query(&query) {
        debug!(%instance, %sender, "duplicate query delivery");
        return;
    }
    if query.is_tracing() {
        kernel.hold_query(&instance);
        kernel.send(
            Message::Trace {
                seed: query.seed,
                instance,
                code: TraceCode::Begin,
            },
            query.client(),
        );
    } else {
        kernel.send(Message::Accept { instance }, forwarder);
        kernel.runqueue_query(&instance);
    }
}

pub fn on_accept(kernel: &Kernel, sender: SocketAddrV4, instance: Key) {
    let Some(attempt) = kernel.cancel_forwarding_timeout(&instance) else {
        warn!(%instance, %sender, "unsolicited or late accept");
        return;
    };
    let host = attempt.destination().unwrap_or(sender);
    debug!(%instance, %host, tries = attempt.tries(), "query accepted");
    if let Some(tracker) = kernel.get_query_tracker(&attempt.seed()) {
        tracker.accepted(instance, host);
    }
    kernel.settle_forwarding(&attempt.seed());
}

pub fn on_reject(kernel: &Kernel, sender: SocketAddrV4, instance: Key, code: RejectCode) {
    let Some(mut attempt) = kernel.cancel_forwarding_timeout(&instance) else {
        warn!(%instance, %sender, ?code, "unsolicited or late reject");
        return;
    };
    debug!(%instance, %sender, ?code, "query rejected");
    if code == RejectCode::Blacklist {
        if let Some(dest) = attempt.destination() {
            attempt.exclude(dest);
        }
    }
    retry(kernel, attempt);
}

/// Timer expiry for a forwarding attempt. Treated exactly like a BUSY rejection.
pub fn on_forwarding_timeout(kernel: &Kernel, instance: Key) {
    let Some(attempt) = kernel.take_expired_forwarding(&instance) else {
        return;
    };
    debug!(%instance, dest = ?attempt.destination(), "forwarding timed out");
    retry(kernel, attempt);
}

/// The only automatic retry path: send the attempt on to its next candidate.
fn retry(kernel: &Kernel, attempt: ForwardingAttempt) {
    kernel.send_query(attempt);
}

pub fn on_fault(kernel: &Kernel, sender: SocketAddrV4, fault: Fault) {
    let Some(tracker) = kernel.get_query_tracker(&fault.seed) else {
        warn!(seed = %fault.seed, %sender, "unsolicited fault");
        return;
    };
    debug!(seed = %fault.seed, %sender, message = ?fault.message, "fault");
    tracker.add_fault(fault);
}

pub fn on_result(kernel: &Kernel, sender: SocketAddrV4, seed: Key, data: Vec<Bytes>) {
    let Some(tracker) = kernel.get_query_tracker(&seed) else {
        warn!(%seed, %sender, "unsolicited result");
        return;
    };
    tracker.add_result(wire::flatten(data));
}

pub fn on_trace(kernel: &Kernel, sender: SocketAddrV4, seed: Key, instance: Key, code: TraceCode) {
    match code {
        // Client side: a worker started.
        TraceCode::Begin => {
            if kernel.is_seed_killed(&seed) {
                warn!(%seed, %instance, %sender, "trace begin for killed seed");
                return;
            }
            let Some(tracker) = kernel.get_query_tracker(&seed) else {
                warn!(%seed, %instance, %sender, "trace begin for unknown seed");
                return;
            };
            tracker.add_worker(instance, sender);
            kernel.send(
                Message::Trace {
                    seed,
                    instance,
                    code: TraceCode::Ok,
                },
                sender,
            );
        }
        // Worker side: the client acknowledged, go.
        TraceCode::Ok => {
            let Some(query) = kernel.unhold_query(&instance) else {
                warn!(%seed, %instance, %sender, "superfluous trace ok");
                return;
            };
            if kernel.is_seed_killed(&query.seed) {
                debug!(%instance, "seed killed while held");
                kernel.finish_query(&instance);
                kernel.send(
                    Message::Reject {
                        instance,
                        code: RejectCode::Blacklist,
                    },
                    query.forwarder(),
                );
                return;
            }
            kernel.runqueue_query(&instance);
            kernel.send(Message::Accept { instance }, query.forwarder());
        }
        // Client side: a worker finished.
        TraceCode::End => {
            let removed = kernel
                .get_query_tracker(&seed)
                .and_then(|t| t.remove_worker(&instance));
            if removed.is_none() {
                warn!(%seed, %instance, %sender, "trace end for unknown worker");
            }
        }
    }
}

pub fn on_ping(kernel: &Kernel, sender: SocketAddrV4, client: Key) {
    let query_key_ids = kernel.outstanding_seed_ids(client.host);
    debug!(%sender, outstanding = query_key_ids.len(), "ping");
    kernel.send(
        Message::Pong {
            key: client,
            query_key_ids,
        },
        sender,
    );
}

pub fn on_pong(kernel: &Kernel, sender: SocketAddrV4, key: Key, query_key_ids: &[i64]) {
    debug!(%sender, ping = %key, outstanding = query_key_ids.len(), "pong");
    for &id in query_key_ids {
        let seed = kernel.local_key(id);
        match kernel.get_query_tracker(&seed) {
            Some(tracker) => tracker.confirm_alive(sender),
            None => debug!(%seed, %sender, "pong for seed no longer tracked"),
        }
    }
}
