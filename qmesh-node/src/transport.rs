//! TCP transport: one outbound connection per destination, opened on first send; inbound
//! connections read length-prefixed frames and hand them to the kernel.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use qmesh_core::{Frame, Kernel, Transport, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LEN_SIZE: usize = 4;

type Outbound = Mutex<HashMap<SocketAddrV4, mpsc::UnboundedSender<Frame>>>;

pub struct TcpTransport {
    peers: Arc<Outbound>,
    runtime: Handle,
}

impl TcpTransport {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        })
    }

    /// Destinations with a writer task.
    pub fn connected(&self) -> usize {
        self.peers.lock().len()
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: SocketAddrV4, frame: Frame) {
        let mut peers = self.peers.lock();
        let frame = match peers.get(&to) {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return,
                // Writer is gone; open a new connection.
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive.
        let _ = tx.send(frame);
        peers.insert(to, tx);
        let registry = Arc::downgrade(&self.peers);
        self.runtime.spawn(run_writer(to, rx, registry));
    }
}

async fn run_writer(
    to: SocketAddrV4,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    registry: Weak<Outbound>,
) {
    match TcpStream::connect(to).await {
        Ok(mut stream) => {
            debug!(%to, "connected");
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    warn!(%to, error = %e, "write failed");
                    break;
                }
            }
        }
        Err(e) => warn!(%to, error = %e, "connect failed; dropping queued messages"),
    }
    drop(rx);
    // A newer writer may have replaced our entry; only a closed sender is ours.
    if let Some(peers) = registry.upgrade() {
        let mut peers = peers.lock();
        if peers.get(&to).is_some_and(|tx| tx.is_closed()) {
            peers.remove(&to);
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    for buf in frame.buffers() {
        stream.write_all(buf).await?;
    }
    stream.flush().await
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, kernel: Arc<Kernel>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let kernel = kernel.clone();
        tokio::spawn(async move {
            if let Err(e) = read_frames(stream, peer, &kernel).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

async fn read_frames(mut stream: TcpStream, peer: SocketAddr, kernel: &Kernel) -> std::io::Result<()> {
    let SocketAddr::V4(peer) = peer else {
        warn!(%peer, "ignoring non-IPv4 connection");
        return Ok(());
    };
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        kernel.deliver(Bytes::from(buf), *peer.ip());
    }
}
