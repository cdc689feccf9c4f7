//! Media relay task: one receive loop, fan-out via non-blocking sends on the
//! same socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use vs_control::Membership;
use vs_media::{DatagramOut, MediaRelay, MemberDirectory, RelayMetrics};

use crate::state::ServerState;

pub type Relay = MediaRelay<Directory, UdpOut, CountersHandle>;

/// Membership lookups for the relay, backed by the control plane's table.
pub struct Directory(pub Arc<Membership>);

impl MemberDirectory for Directory {
    fn fanout_targets(&self, source: u32) -> Option<Vec<SocketAddr>> {
        self.0.fanout_targets(source)
    }

    fn set_talking(&self, source: u32, talking: bool) {
        self.0.set_talking_by_source(source, talking);
    }
}

/// Fan-out sends reuse the receive socket; `try_send_to` never blocks and a
/// would-block counts as a dropped datagram.
pub struct UdpOut(pub Arc<UdpSocket>);

impl DatagramOut for UdpOut {
    fn send_to(&self, target: SocketAddr, datagram: &Bytes) -> std::io::Result<()> {
        self.0.try_send_to(datagram, target).map(|_| ())
    }
}

#[derive(Default)]
pub struct RelayCounters {
    pub rx_datagrams: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub forwarded: AtomicU64,
    pub drop_invalid: AtomicU64,
    pub drop_oversize: AtomicU64,
    pub drop_unknown_source: AtomicU64,
    pub send_errors: AtomicU64,
}

/// Newtype over `Arc<RelayCounters>` so the orphan rule lets us implement
/// the foreign `RelayMetrics` trait while still sharing the same counters
/// with the rest of the server.
#[derive(Clone)]
pub struct CountersHandle(pub Arc<RelayCounters>);

impl RelayMetrics for CountersHandle {
    fn inc_rx(&self, bytes: usize) {
        self.0.rx_datagrams.fetch_add(1, Ordering::Relaxed);
        self.0.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    fn inc_drop_invalid(&self) {
        self.0.drop_invalid.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_drop_oversize(&self) {
        self.0.drop_oversize.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_drop_unknown_source(&self) {
        self.0.drop_unknown_source.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_send_error(&self) {
        self.0.send_errors.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_forwarded(&self, fanout: usize) {
        self.0.forwarded.fetch_add(fanout as u64, Ordering::Relaxed);
    }
}

pub async fn run(state: Arc<ServerState>, socket: Arc<UdpSocket>, relay: Arc<Relay>) {
    let mut buf = [0u8; 2048];
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => {
                    relay.handle_datagram(from, Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    warn!("media receive failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("media relay stopped");
}
