//! Server discovery: broadcast a request every few seconds, keep a table of
//! whoever answers. Independent of any session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use vs_protocol::control::{ControlMessage, FrameAccumulator};
use vs_protocol::discovery::{DiscoveryRequest, DiscoveryResponse};
use vs_protocol::DISCOVERY_INTERVAL_SECS;

#[derive(Clone, Debug)]
pub struct DiscoveredServer {
    pub server_id: u32,
    pub addr: IpAddr,
    pub tcp_port: u16,
    pub media_port: u16,
    pub caps: u32,
    pub cur_peers: u16,
    pub max_peers: u16,
    pub name: String,
    pub version: String,
    pub last_seen: Instant,
}

impl DiscoveredServer {
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.tcp_port)
    }
}

/// Responses keyed by server id; a repeat answer overwrites in place.
#[derive(Default)]
pub struct ServerTable {
    servers: DashMap<u32, DiscoveredServer>,
}

impl ServerTable {
    pub fn upsert(&self, from: IpAddr, response: DiscoveryResponse) {
        let entry = DiscoveredServer {
            server_id: response.server_id,
            addr: from,
            tcp_port: response.tcp_port,
            media_port: response.media_port,
            caps: response.caps,
            cur_peers: response.cur_peers,
            max_peers: response.max_peers,
            name: response.name,
            version: response.version,
            last_seen: Instant::now(),
        };
        let first_sighting = !self.servers.contains_key(&entry.server_id);
        if first_sighting {
            info!(
                server_id = entry.server_id,
                name = %entry.name,
                version = %entry.version,
                addr = %entry.addr,
                media_port = entry.media_port,
                caps = entry.caps,
                peers = format_args!("{}/{}", entry.cur_peers, entry.max_peers),
                "server discovered"
            );
        }
        self.servers.insert(entry.server_id, entry);
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Most recently seen server, for auto-connect.
    pub fn pick(&self) -> Option<DiscoveredServer> {
        self.servers
            .iter()
            .max_by_key(|e| e.last_seen)
            .map(|e| e.value().clone())
    }
}

pub async fn run_requester(
    discovery_port: u16,
    client_id: u32,
    name: String,
    table: std::sync::Arc<ServerTable>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.context("bind discovery socket")?;
    socket.set_broadcast(true).context("enable broadcast")?;
    let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), discovery_port);

    let mut interval = tokio::time::interval(Duration::from_secs(DISCOVERY_INTERVAL_SECS));
    let mut buf = [0u8; 512];
    let mut seq: u32 = 1;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let request = ControlMessage::DiscoveryRequest(DiscoveryRequest {
                    client_id,
                    service_mask: 0,
                    name: name.clone(),
                });
                seq = seq.wrapping_add(1);
                if let Err(e) = socket.send_to(&request.to_frame(seq), broadcast).await {
                    debug!("discovery broadcast failed: {e}");
                }
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => {
                    if let Some(response) = decode_response(&buf[..n]) {
                        trace!(%from, server_id = response.server_id, "discovery response");
                        table.upsert(from.ip(), response);
                    }
                }
                Err(e) => {
                    debug!("discovery receive failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("discovery requester stopped");
    Ok(())
}

fn decode_response(datagram: &[u8]) -> Option<DiscoveryResponse> {
    let mut acc = FrameAccumulator::new();
    acc.extend(datagram);
    let (header, body) = acc.next_frame().ok()??;
    match ControlMessage::decode(header.msg_type, &body).ok()? {
        ControlMessage::DiscoveryResponse(response) => Some(response),
        _ => None,
    }
}
