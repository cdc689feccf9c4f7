//! Discovery responder: one request, one unicast reply. No session state.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use vs_protocol::control::{ControlMessage, FrameAccumulator};
use vs_protocol::discovery::{DiscoveryResponse, CAP_CODEC, CAP_JITTER, CAP_VAD};

use crate::state::ServerState;

pub async fn run(state: Arc<ServerState>, socket: UdpSocket, control_port: u16, media_port: u16) {
    let mut buf = [0u8; 512];
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            r = socket.recv_from(&mut buf) => {
                let (n, from) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("discovery receive failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let Some(request) = decode_request(&buf[..n]) else {
                    trace!(%from, "ignoring malformed discovery datagram");
                    continue;
                };
                debug!(%from, client_id = request.client_id, name = %request.name, "discovery request");

                let response = ControlMessage::DiscoveryResponse(DiscoveryResponse {
                    server_id: state.server_id,
                    tcp_port: control_port,
                    media_port,
                    caps: CAP_CODEC | CAP_VAD | CAP_JITTER,
                    cur_peers: state.membership.session_count() as u16,
                    max_peers: state.membership.capacity() as u16,
                    name: state.cfg.name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                });
                let frame = response.to_frame(state.membership.next_seq());
                if let Err(e) = socket.try_send_to(&frame, from) {
                    trace!(%from, "discovery reply failed: {e}");
                }
            }
        }
    }
    debug!("discovery responder stopped");
}

fn decode_request(datagram: &[u8]) -> Option<vs_protocol::discovery::DiscoveryRequest> {
    let mut acc = FrameAccumulator::new();
    acc.extend(datagram);
    let (header, body) = acc.next_frame().ok()??;
    match ControlMessage::decode(header.msg_type, &body).ok()? {
        ControlMessage::DiscoveryRequest(req) => Some(req),
        _ => None,
    }
}
