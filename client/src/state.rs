//! Connection phase and the local view of the peer list.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, trace};

use vs_protocol::peer::PeerRecord;

use crate::net::control::PushEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Joining,
    InSession,
}

pub struct ClientState {
    phase: Mutex<Phase>,
    peers: Mutex<HashMap<u32, PeerRecord>>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Disconnected),
            peers: Mutex::new(HashMap::new()),
        }
    }
}

impl ClientState {
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Replace the peer list with the JOIN_ACK snapshot.
    pub fn set_peer_list(&self, records: Vec<PeerRecord>) {
        let mut peers = self.peers.lock();
        peers.clear();
        for record in records {
            peers.insert(record.id, record);
        }
    }

    pub fn apply_push(&self, event: &PushEvent) {
        match event {
            PushEvent::PeerJoined(record) => {
                info!(id = record.id, name = %record.name, "peer joined");
                self.peers.lock().insert(record.id, record.clone());
            }
            PushEvent::PeerLeft(id) => {
                if let Some(record) = self.peers.lock().remove(id) {
                    info!(id, name = %record.name, "peer left");
                }
            }
            PushEvent::PeerState(state) => {
                if let Some(record) = self.peers.lock().get_mut(&state.id) {
                    record.talking = state.talking;
                    record.muted = state.muted;
                    record.audio_active = state.audio_active;
                }
            }
            PushEvent::HeartbeatAck { server_time_ms } => {
                trace!(server_time_ms, "heartbeat ack");
            }
            PushEvent::TimeSync(ts) => {
                trace!(client = ts.client_time_ms, server = ts.server_time_ms, "time sync");
            }
            PushEvent::Closed => {}
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().values().cloned().collect()
    }

    /// Session teardown: forget everything.
    pub fn clear(&self) {
        self.peers.lock().clear();
        *self.phase.lock() = Phase::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vs_protocol::control::PeerState;

    fn record(id: u32) -> PeerRecord {
        PeerRecord {
            id,
            source: id,
            name: format!("p{id}"),
            ip: "10.0.0.1".into(),
            udp_port: 6000,
            talking: false,
            muted: false,
            audio_active: false,
            peer_type: 0,
        }
    }

    #[test]
    fn pushes_maintain_the_peer_list() {
        let state = ClientState::default();
        state.set_peer_list(vec![record(1), record(2)]);
        assert_eq!(state.peer_count(), 2);

        state.apply_push(&PushEvent::PeerJoined(record(3)));
        assert_eq!(state.peer_count(), 3);

        state.apply_push(&PushEvent::PeerState(PeerState {
            id: 3,
            talking: true,
            muted: false,
            audio_active: true,
        }));
        let peers = state.peers();
        assert!(peers.iter().find(|p| p.id == 3).unwrap().talking);

        state.apply_push(&PushEvent::PeerLeft(1));
        assert_eq!(state.peer_count(), 2);

        state.clear();
        assert_eq!(state.peer_count(), 0);
        assert_eq!(state.phase(), Phase::Disconnected);
    }
}
