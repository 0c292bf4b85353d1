//! In-process network: several kernels in one runtime, exchanging encoded frames.
//!
//! Frames go through the full encode/decode path. Nodes can be marked down, which silently
//! drops everything sent to or from them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::kernel::{Kernel, Transport};
use crate::wire::Frame;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<SocketAddrV4, Weak<Kernel>>>,
    down: RwLock<HashSet<SocketAddrV4>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node listening at `addr`. Attach the kernel once it is built.
    pub fn transport_for(self: &Arc<Self>, addr: SocketAddrV4) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from: addr,
        })
    }

    pub fn attach(&self, kernel: &Arc<Kernel>) {
        self.nodes
            .write()
            .insert(kernel.listen(), Arc::downgrade(kernel));
    }

    pub fn set_down(&self, addr: SocketAddrV4, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    fn route(&self, from: SocketAddrV4, to: SocketAddrV4, frame: Frame) {
        {
            let down = self.down.read();
            if down.contains(&to) || down.contains(&from) {
                trace!(%from, %to, "dropped: node down");
                return;
            }
        }
        let target = self.nodes.read().get(&to).and_then(Weak::upgrade);
        match target {
            Some(kernel) => kernel.deliver(frame.into_bytes(), *from.ip()),
            None => trace!(%from, %to, "dropped: no such node"),
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("nodes", &self.nodes.read().len())
            .field("down", &*self.down.read())
            .finish()
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: SocketAddrV4,
}

impl Transport for LocalTransport {
    fn send(&self, to: SocketAddrV4, frame: Frame) {
        self.network.route(self.from, to, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::membership::StaticMembership;
    use crate::protocol::{Mode, Modes, Query};
    use crate::query_type::{QueryContext, QueryError};
    use crate::test_support::addr;
    use crate::tracker::SeedEvent;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn node(net: &Arc<LocalNetwork>, last: u8, membership: StaticMembership) -> Arc<Kernel> {
        let cfg = KernelConfig {
            forward_timeout_ms: 200,
            ..KernelConfig::default()
        };
        let k = Kernel::with_load_source(
            addr(last),
            cfg,
            net.transport_for(addr(last)),
            Arc::new(membership),
            Arc::new(|| Some(0.0)),
        )
        .unwrap();
        net.attach(&k);
        k
    }

    fn echo(k: &Kernel, id: i32) {
        k.register_query_type(
            id,
            |q: &Query, ctx: &mut QueryContext| -> Result<(), QueryError> {
                ctx.add_result(q.payload.clone());
                Ok(())
            },
        );
    }

    /// Collect events until `done` holds for the collected list.
    async fn until(
        events: &mut UnboundedReceiver<SeedEvent>,
        done: impl Fn(&[SeedEvent]) -> bool,
    ) -> Vec<SeedEvent> {
        let mut seen = Vec::new();
        while !done(&seen) {
            let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for seed event")
                .expect("event channel closed");
            seen.push(ev);
        }
        seen
    }

    fn results(events: &[SeedEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                SeedEvent::Result(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_runs_on_replica() {
        let net = LocalNetwork::new();
        let client = node(&net, 1, StaticMembership::new().with_replicas(7, vec![addr(2)]));
        let worker = node(&net, 2, StaticMembership::new());
        echo(&worker, 0);

        let mut sub = client.submit_query(0, Some(7), vec![Bytes::from_static(b"hi")], Modes::empty());
        let seen = until(&mut sub.events, |s| {
            !results(s).is_empty() && s.iter().any(|e| matches!(e, SeedEvent::Accepted { .. }))
        })
        .await;
        assert_eq!(results(&seen), vec![Bytes::from_static(b"hi")]);
        assert!(seen
            .iter()
            .any(|e| matches!(e, SeedEvent::Accepted { host, .. } if *host == addr(2))));
        assert_eq!(client.pending_forwarding_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn traced_query_reports_worker_lifecycle() {
        let net = LocalNetwork::new();
        let client = node(&net, 1, StaticMembership::new().with_replicas(7, vec![addr(2)]));
        let worker = node(&net, 2, StaticMembership::new());
        echo(&worker, 0);

        let modes = Modes::empty().with(Mode::Tracing);
        let mut sub = client.submit_query(0, Some(7), vec![Bytes::from_static(b"t")], modes);
        let seen = until(&mut sub.events, |s| {
            !results(s).is_empty()
                && s.iter().any(|e| matches!(e, SeedEvent::WorkerFinished { .. }))
        })
        .await;

        let started: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e, SeedEvent::WorkerStarted { .. }))
            .collect();
        let finished = seen
            .iter()
            .filter(|e| matches!(e, SeedEvent::WorkerFinished { .. }))
            .count();
        assert_eq!(started.len(), 1);
        assert_eq!(finished, 1);
        assert!(matches!(seen[0], SeedEvent::WorkerStarted { host, .. } if host == addr(2)));
        assert!(sub.tracker.workers().is_empty());
        assert_eq!(worker.worklog_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn down_replica_falls_back() {
        let net = LocalNetwork::new();
        let client = node(
            &net,
            1,
            StaticMembership::new().with_replicas(7, vec![addr(2), addr(3)]),
        );
        let a = node(&net, 2, StaticMembership::new());
        let b = node(&net, 3, StaticMembership::new());
        echo(&a, 0);
        echo(&b, 0);
        net.set_down(addr(2), true);

        let mut sub = client.submit_query(0, Some(7), vec![Bytes::from_static(b"x")], Modes::empty());
        let seen = until(&mut sub.events, |s| !results(s).is_empty()).await;
        assert_eq!(results(&seen), vec![Bytes::from_static(b"x")]);
        assert_eq!(a.worklog_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn killed_seed_moves_to_other_replica() {
        let net = LocalNetwork::new();
        let client = node(
            &net,
            1,
            StaticMembership::new().with_replicas(7, vec![addr(2), addr(3)]),
        );
        let a = node(&net, 2, StaticMembership::new());
        let b = node(&net, 3, StaticMembership::new());
        echo(&a, 0);
        echo(&b, 0);
        // Seed ids start at zero on the client.
        a.kill_seed(client.local_key(0));

        let mut sub = client.submit_query(0, Some(7), vec![Bytes::from_static(b"y")], Modes::empty());
        assert_eq!(sub.seed, client.local_key(0));
        let seen = until(&mut sub.events, |s| {
            s.iter()
                .any(|e| matches!(e, SeedEvent::Accepted { host, .. } if *host == addr(3)))
                && !results(s).is_empty()
        })
        .await;
        assert_eq!(results(&seen), vec![Bytes::from_static(b"y")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_continues_on_next_partition() {
        let net = LocalNetwork::new();
        let client = node(&net, 1, StaticMembership::new().with_replicas(7, vec![addr(2)]));
        let first = node(&net, 2, StaticMembership::new().with_replicas(8, vec![addr(3)]));
        let second = node(&net, 3, StaticMembership::new());
        first.register_query_type(
            5,
            |q: &Query, ctx: &mut QueryContext| -> Result<(), QueryError> {
                assert_eq!(q.generation, 0);
                ctx.forward(Some(8), vec![Bytes::from_static(b"onward")]);
                ctx.add_result(vec![Bytes::from_static(b"first")]);
                Ok(())
            },
        );
        second.register_query_type(
            5,
            |q: &Query, ctx: &mut QueryContext| -> Result<(), QueryError> {
                if q.generation != 1 {
                    return Err(QueryError::Failed(format!("generation {}", q.generation)));
                }
                ctx.add_result(q.payload.clone());
                Ok(())
            },
        );

        let mut sub = client.submit_query(5, Some(7), vec![], Modes::empty());
        let seen = until(&mut sub.events, |s| results(s).len() == 2).await;
        let mut got = results(&seen);
        got.sort();
        assert_eq!(
            got,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"onward")]
        );
        assert!(sub.tracker.faults().is_empty());
        // The middle node drops its relay tracker once the onward send is accepted.
        tokio::time::timeout(Duration::from_secs(5), async {
            while first.tracker_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay tracker never released");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_query_type_faults() {
        let net = LocalNetwork::new();
        let client = node(&net, 1, StaticMembership::new().with_replicas(7, vec![addr(2)]));
        let _worker = node(&net, 2, StaticMembership::new());

        let mut sub = client.submit_query(42, Some(7), vec![], Modes::empty());
        let seen = until(&mut sub.events, |s| {
            s.iter().any(|e| matches!(e, SeedEvent::Fault(_)))
        })
        .await;
        let Some(SeedEvent::Fault(f)) = seen.iter().find(|e| matches!(e, SeedEvent::Fault(_))) else {
            unreachable!();
        };
        assert_eq!(f.message.as_deref(), Some("unknown query type 42"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_confirms_running_worker() {
        let net = LocalNetwork::new();
        let client = node(&net, 1, StaticMembership::new().with_replicas(7, vec![addr(2)]));
        let worker = node(&net, 2, StaticMembership::new());
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = parking_lot::Mutex::new(gate);
        worker.register_query_type(
            0,
            move |_: &Query, ctx: &mut QueryContext| -> Result<(), QueryError> {
                let _ = gate.lock().recv_timeout(Duration::from_secs(5));
                ctx.add_result(vec![Bytes::from_static(b"done")]);
                Ok(())
            },
        );

        let mut sub = client.submit_query(0, Some(7), vec![], Modes::empty());
        until(&mut sub.events, |s| {
            s.iter().any(|e| matches!(e, SeedEvent::Accepted { .. }))
        })
        .await;

        let confirmed = async {
            loop {
                client.ping(addr(2));
                if sub.tracker.last_confirmed(&addr(2)).is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), confirmed)
            .await
            .expect("no pong confirmation");

        release.send(()).unwrap();
        let seen = until(&mut sub.events, |s| !results(s).is_empty()).await;
        assert_eq!(results(&seen), vec![Bytes::from_static(b"done")]);
    }
}
