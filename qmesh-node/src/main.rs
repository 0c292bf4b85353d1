// qmesh node: TCP transport, replica membership, liveness pings.

mod builtin;
mod config;
mod transport;

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use qmesh_core::Kernel;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut verbosity = 0u8;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("qmesh-node {}", VERSION);
                return Ok(());
            }
            "-v" => verbosity = verbosity.saturating_add(1),
            "-vv" => verbosity = verbosity.saturating_add(2),
            other => bail!("unknown argument: {other}"),
        }
    }
    init_tracing(verbosity);

    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let membership = cfg.membership()?;
    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    let tcp = transport::TcpTransport::new(tokio::runtime::Handle::current());
    let kernel = Kernel::new(
        cfg.listen,
        cfg.kernel.clone(),
        tcp.clone(),
        Arc::new(membership),
    )?;
    builtin::register(&kernel, cfg.partitions());

    let mut server = tokio::spawn(transport::serve(listener, kernel.clone()));
    let pinger = tokio::spawn(ping_loop(
        kernel.clone(),
        tcp,
        cfg.peers.clone(),
        Duration::from_secs(cfg.ping_interval_secs.max(1)),
    ));
    tracing::info!(listen = %cfg.listen, peers = cfg.peers.len(), "node started");

    let outcome = tokio::select! {
        r = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            r
        }
        r = &mut server => match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("listener failed")),
            Err(e) => Err(anyhow::Error::new(e).context("listener task")),
        },
    };
    pinger.abort();
    server.abort();
    kernel.shutdown();
    tracing::info!("node stopped");
    outcome
}

/// Ask every peer which of our seeds it still holds.
async fn ping_loop(
    kernel: Arc<Kernel>,
    tcp: Arc<transport::TcpTransport>,
    peers: Vec<SocketAddrV4>,
    every: Duration,
) {
    if peers.is_empty() {
        return;
    }
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        for &peer in &peers {
            kernel.ping(peer);
        }
        tracing::debug!(
            worklog = kernel.worklog_count(),
            forwarding = kernel.pending_forwarding_count(),
            connections = tcp.connected(),
            "pinged peers"
        );
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
