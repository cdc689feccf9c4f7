use vs_protocol::control::{ControlMessage, PeerState};
use vs_protocol::peer::PeerRecord;

/// Membership changes pushed to every session member except the subject.
#[derive(Clone, Debug)]
pub enum MembershipEvent {
    PeerJoined(PeerRecord),
    PeerLeft(u32),
    PeerStateChanged { id: u32, talking: bool, muted: bool, audio_active: bool },
}

impl MembershipEvent {
    pub fn to_message(&self) -> ControlMessage {
        match self {
            Self::PeerJoined(record) => ControlMessage::PeerJoin(record.clone()),
            Self::PeerLeft(id) => ControlMessage::PeerLeave { id: *id },
            Self::PeerStateChanged { id, talking, muted, audio_active } => {
                ControlMessage::PeerState(PeerState {
                    id: *id,
                    talking: *talking,
                    muted: *muted,
                    audio_active: *audio_active,
                })
            }
        }
    }
}
