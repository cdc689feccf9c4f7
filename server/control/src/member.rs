use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use vs_protocol::peer::PeerRecord;

/// Handle to one control connection's table entry: slot index plus a
/// generation stamp, so a handle left over from a removed member can never
/// touch a later occupant of the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnId {
    pub(crate) slot: usize,
    pub(crate) gen: u64,
}

impl ConnId {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// TCP accepted, nothing heard yet.
    Accepted,
    /// HELLO processed, id assigned.
    Identified,
    /// JOIN processed, media address known.
    InSession,
    /// Leaving; slot is about to be reclaimed.
    Left,
}

pub struct Member {
    pub id: u32,
    /// Media source identifier; equal to `id` in this system.
    pub source: u32,
    pub name: String,
    pub state: MemberState,
    pub control_addr: SocketAddr,
    /// Control IP + the UDP port carried by JOIN.
    pub media_addr: Option<SocketAddr>,
    pub last_heartbeat: Instant,
    pub audio_active: bool,
    pub talking: bool,
    pub muted: bool,
    /// Writer queue for this member's control connection. Sends are
    /// `try_send`; a full queue drops the frame rather than blocking the
    /// table lock.
    pub tx: mpsc::Sender<Bytes>,
}

impl Member {
    pub fn new(control_addr: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: 0,
            source: 0,
            name: String::new(),
            state: MemberState::Accepted,
            control_addr,
            media_addr: None,
            last_heartbeat: Instant::now(),
            audio_active: false,
            talking: false,
            muted: false,
            tx,
        }
    }

    pub fn in_session(&self) -> bool {
        self.state == MemberState::InSession
    }

    pub fn record(&self) -> PeerRecord {
        let (ip, udp_port) = match self.media_addr {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (self.control_addr.ip().to_string(), 0),
        };
        PeerRecord {
            id: self.id,
            source: self.source,
            name: self.name.clone(),
            ip,
            udp_port,
            talking: self.talking,
            muted: self.muted,
            audio_active: self.audio_active,
            peer_type: 0,
        }
    }
}
