//! Query types every node serves.

use qmesh_core::{Kernel, Query, QueryContext, QueryError};

/// Returns the payload unchanged.
pub const ECHO: i32 = 0;
/// Fans the payload out to every known partition, each of which echoes it back.
pub const SCATTER: i32 = 1;

pub fn register(kernel: &Kernel, partitions: Vec<i64>) {
    kernel.register_query_type(ECHO, echo);
    kernel.register_query_type(
        SCATTER,
        move |q: &Query, ctx: &mut QueryContext| -> Result<(), QueryError> {
            if q.generation > 0 {
                return echo(q, ctx);
            }
            if partitions.is_empty() {
                return Err(QueryError::Failed("no partitions configured".into()));
            }
            for &p in &partitions {
                ctx.forward(Some(p), q.payload.clone());
            }
            Ok(())
        },
    );
}

fn echo(q: &Query, ctx: &mut QueryContext) -> Result<(), QueryError> {
    ctx.add_result(q.payload.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use qmesh_core::{KernelConfig, LocalNetwork, Modes, SeedEvent, StaticMembership};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use std::time::Duration;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, last), 36462)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scatter_reaches_every_partition() {
        let net = LocalNetwork::new();
        let membership = StaticMembership::new()
            .with_replicas(1, vec![addr(2)])
            .with_replicas(2, vec![addr(3)]);
        let mut kernels = Vec::new();
        for last in 1..=3 {
            let k = Kernel::new(
                addr(last),
                KernelConfig::default(),
                net.transport_for(addr(last)),
                Arc::new(membership.clone()),
            )
            .unwrap();
            net.attach(&k);
            register(&k, vec![1, 2]);
            kernels.push(k);
        }

        let mut sub = kernels[0].submit_to(
            SCATTER,
            None,
            vec![Bytes::from_static(b"s")],
            Modes::empty(),
            vec![addr(1)],
        );
        let mut results = 0;
        tokio::time::timeout(Duration::from_secs(5), async {
            while results < 2 {
                if let Some(SeedEvent::Result(b)) = sub.events.recv().await {
                    assert_eq!(b, Bytes::from_static(b"s"));
                    results += 1;
                }
            }
        })
        .await
        .unwrap();
        assert!(sub.tracker.faults().is_empty());
    }
}
