//! Media-channel plumbing: RTP send on the capture path, receive task
//! feeding the mixer on the playout path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace};

use vs_protocol::rtp::{encode_datagram, MediaHeader, FLAG_VOICE};

use crate::audio::mixer::Mixer;

/// Outgoing RTP framing for one session. Sequence and timestamp state live
/// with the capture loop; this only owns the socket and the header fields
/// that never change.
pub struct MediaChannel {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    source: u32,
    payload_type: u8,
}

impl MediaChannel {
    pub fn new(socket: Arc<UdpSocket>, server: SocketAddr, source: u32, payload_type: u8) -> Self {
        Self { socket, server, source, payload_type }
    }

    /// One frame, one datagram, non-blocking. A would-block is a dropped
    /// frame, same as the wire dropping it.
    pub fn send_frame(&self, seq: u16, timestamp: u32, voice: bool, payload: &[u8]) -> std::io::Result<()> {
        let header = MediaHeader {
            payload_type: self.payload_type,
            seq,
            timestamp,
            source: self.source,
            payload_len: payload.len() as u16,
            flags: if voice { FLAG_VOICE } else { 0 },
        };
        let datagram = encode_datagram(&header, payload);
        self.socket.try_send_to(&datagram, self.server).map(|_| ())
    }
}

/// Receive loop: every valid datagram goes to the mixer, which routes it to
/// the right per-source jitter buffer.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    mixer: Arc<Mixer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => match vs_protocol::rtp::decode_datagram(&buf[..n]) {
                    Ok((header, payload)) => mixer.insert(&header, payload),
                    Err(e) => trace!(%from, "discarding media datagram: {e}"),
                },
                Err(e) => {
                    debug!("media receive failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("media receiver stopped");
}
