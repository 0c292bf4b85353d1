//! Helpers shared by unit tests.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::KernelConfig;
use crate::kernel::{Kernel, Transport};
use crate::membership::StaticMembership;
use crate::protocol::Message;
use crate::wire::{self, Frame};

pub(crate) fn addr(last: u8) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, last), 36462)
}

/// Transport that keeps every sent message, decoded.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddrV4, Message)>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn take(&self) -> Vec<(SocketAddrV4, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: SocketAddrV4, frame: Frame) {
        let env = wire::decode(frame.into_bytes(), Ipv4Addr::LOCALHOST).unwrap();
        self.sent.lock().push((to, env.message));
    }
}

pub(crate) fn kernel_at(last: u8, config: KernelConfig) -> (Arc<Kernel>, Arc<RecordingTransport>) {
    kernel_with(last, config, StaticMembership::new())
}

pub(crate) fn kernel_with(
    last: u8,
    config: KernelConfig,
    membership: StaticMembership,
) -> (Arc<Kernel>, Arc<RecordingTransport>) {
    let t = RecordingTransport::new();
    let idle = Arc::new(|| Some(0.0));
    let k = Kernel::with_load_source(addr(last), config, t.clone(), Arc::new(membership), idle)
        .unwrap();
    (k, t)
}
