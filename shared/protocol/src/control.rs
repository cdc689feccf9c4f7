//! Control-channel framing and typed messages.
//!
//! Every control message (TCP session channel and UDP discovery exchange)
//! starts with the same fixed header:
//!
//! ```text
//!  0: u32 magic        0x5356_5043
//!  4: u16 version      currently 1
//!  6: u16 msg_type     codes below
//!  8: u32 payload_len  bytes following the header
//! 12: u32 seq          per-connection counter
//! 16: u32 timestamp    sender wall clock, milliseconds
//! ```
//!
//! All integers little-endian. Maximum total frame size is 4096 bytes.
//! Stream reassembly is done by [`FrameAccumulator`]; a magic mismatch
//! clears the accumulator (resync by disconnect).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::discovery::{DiscoveryRequest, DiscoveryResponse};
use crate::peer::{get_fixed_str, put_fixed_str, PeerRecord, NAME_LEN};
use crate::{wall_ms, ProtocolError, ProtocolResult};

pub const CONTROL_MAGIC: u32 = 0x5356_5043;
pub const CONTROL_VERSION: u16 = 1;
pub const CONTROL_HEADER_LEN: usize = 20;
pub const MAX_CONTROL_FRAME: usize = 4096;

/// Message type codes. Fixed numeric values; deployed clients depend on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    DiscoveryRequest = 1,
    DiscoveryResponse = 2,
    Hello = 3,
    HelloAck = 4,
    Join = 5,
    JoinAck = 6,
    Leave = 7,
    Heartbeat = 8,
    AudioStart = 9,
    AudioStop = 10,
    AudioMute = 11,
    AudioUnmute = 12,
    PeerList = 13,
    PeerJoin = 14,
    PeerLeave = 15,
    PeerState = 16,
    TimeSync = 17,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::DiscoveryRequest,
            2 => Self::DiscoveryResponse,
            3 => Self::Hello,
            4 => Self::HelloAck,
            5 => Self::Join,
            6 => Self::JoinAck,
            7 => Self::Leave,
            8 => Self::Heartbeat,
            9 => Self::AudioStart,
            10 => Self::AudioStop,
            11 => Self::AudioMute,
            12 => Self::AudioUnmute,
            13 => Self::PeerList,
            14 => Self::PeerJoin,
            15 => Self::PeerLeave,
            16 => Self::PeerState,
            17 => Self::TimeSync,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ControlHeader {
    pub version: u16,
    /// Raw code; unknown values are surfaced so the caller can skip the frame.
    pub msg_type: u16,
    pub payload_len: u32,
    pub seq: u32,
    pub timestamp_ms: u32,
}

impl ControlHeader {
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::from_u16(self.msg_type)
    }

    fn decode(buf: &mut impl Buf) -> ProtocolResult<Self> {
        need(buf, CONTROL_HEADER_LEN)?;
        let magic = buf.get_u32_le();
        if magic != CONTROL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = buf.get_u16_le();
        if version != CONTROL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        Ok(Self {
            version,
            msg_type: buf.get_u16_le(),
            payload_len: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            timestamp_ms: buf.get_u32_le(),
        })
    }
}

/// Build one complete control frame (header + payload).
pub fn encode_frame(msg_type: MsgType, seq: u32, timestamp_ms: u32, payload: &[u8]) -> Bytes {
    debug_assert!(CONTROL_HEADER_LEN + payload.len() <= MAX_CONTROL_FRAME);
    let mut b = BytesMut::with_capacity(CONTROL_HEADER_LEN + payload.len());
    b.put_u32_le(CONTROL_MAGIC);
    b.put_u16_le(CONTROL_VERSION);
    b.put_u16_le(msg_type as u16);
    b.put_u32_le(payload.len() as u32);
    b.put_u32_le(seq);
    b.put_u32_le(timestamp_ms);
    b.extend_from_slice(payload);
    b.freeze()
}

/// Receive-side accumulator for the length-prefixed control stream.
///
/// Bytes go in as they arrive; complete frames come out. A magic mismatch or
/// an oversize length clears the buffer and returns the error — the caller is
/// expected to drop the connection rather than hunt for the next frame start.
#[derive(Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<(ControlHeader, Bytes)>> {
        if self.buf.len() < CONTROL_HEADER_LEN {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        if magic != CONTROL_MAGIC {
            self.buf.clear();
            return Err(ProtocolError::BadMagic(magic));
        }
        let payload_len = u32::from_le_bytes(self.buf[8..12].try_into().unwrap()) as usize;
        let total = CONTROL_HEADER_LEN + payload_len;
        if total > MAX_CONTROL_FRAME {
            self.buf.clear();
            return Err(ProtocolError::Oversize(total));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        let header = ControlHeader::decode(&mut frame)?;
        Ok(Some((header, frame.freeze())))
    }
}

// ---- typed payloads ----

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    /// Client-proposed id; 0 asks the server to assign one.
    pub proposed_id: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub result: u32,
    pub assigned_id: u32,
    pub media_port: u16,
    pub server_time_ms: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Join {
    /// Local UDP port the client receives media on; the server pairs it with
    /// the control connection's IP to learn the media address.
    pub media_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinAck {
    pub result: u32,
    pub source: u32,
    /// wall_ms * (sample_rate / 1000), truncated — the joiner's RTP epoch.
    pub base_timestamp: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub time_ms: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerState {
    pub id: u32,
    pub talking: bool,
    pub muted: bool,
    pub audio_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeSync {
    pub client_time_ms: u32,
    pub server_time_ms: u32,
}

/// One decoded control message, any direction.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    DiscoveryRequest(DiscoveryRequest),
    DiscoveryResponse(DiscoveryResponse),
    Hello(Hello),
    HelloAck(HelloAck),
    Join(Join),
    JoinAck(JoinAck),
    Leave,
    Heartbeat(Heartbeat),
    AudioStart,
    AudioStop,
    AudioMute,
    AudioUnmute,
    PeerList(Vec<PeerRecord>),
    PeerJoin(PeerRecord),
    PeerLeave { id: u32 },
    PeerState(PeerState),
    TimeSync(TimeSync),
}

impl ControlMessage {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::DiscoveryRequest(_) => MsgType::DiscoveryRequest,
            Self::DiscoveryResponse(_) => MsgType::DiscoveryResponse,
            Self::Hello(_) => MsgType::Hello,
            Self::HelloAck(_) => MsgType::HelloAck,
            Self::Join(_) => MsgType::Join,
            Self::JoinAck(_) => MsgType::JoinAck,
            Self::Leave => MsgType::Leave,
            Self::Heartbeat(_) => MsgType::Heartbeat,
            Self::AudioStart => MsgType::AudioStart,
            Self::AudioStop => MsgType::AudioStop,
            Self::AudioMute => MsgType::AudioMute,
            Self::AudioUnmute => MsgType::AudioUnmute,
            Self::PeerList(_) => MsgType::PeerList,
            Self::PeerJoin(_) => MsgType::PeerJoin,
            Self::PeerLeave { .. } => MsgType::PeerLeave,
            Self::PeerState(_) => MsgType::PeerState,
            Self::TimeSync(_) => MsgType::TimeSync,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut b = BytesMut::new();
        match self {
            Self::DiscoveryRequest(m) => m.encode(&mut b),
            Self::DiscoveryResponse(m) => m.encode(&mut b),
            Self::Hello(m) => {
                b.put_u32_le(m.proposed_id);
                put_fixed_str::<NAME_LEN>(&mut b, &m.name);
            }
            Self::HelloAck(m) => {
                b.put_u32_le(m.result);
                b.put_u32_le(m.assigned_id);
                b.put_u16_le(m.media_port);
                b.put_u32_le(m.server_time_ms);
            }
            Self::Join(m) => b.put_u16_le(m.media_port),
            Self::JoinAck(m) => {
                b.put_u32_le(m.result);
                b.put_u32_le(m.source);
                b.put_u32_le(m.base_timestamp);
            }
            Self::Leave | Self::AudioStart | Self::AudioStop | Self::AudioMute | Self::AudioUnmute => {}
            Self::Heartbeat(m) => b.put_u32_le(m.time_ms),
            Self::PeerList(records) => {
                b.put_u8(records.len() as u8);
                for r in records {
                    r.encode(&mut b);
                }
            }
            Self::PeerJoin(r) => r.encode(&mut b),
            Self::PeerLeave { id } => b.put_u32_le(*id),
            Self::PeerState(m) => {
                b.put_u32_le(m.id);
                b.put_u8(m.talking as u8);
                b.put_u8(m.muted as u8);
                b.put_u8(m.audio_active as u8);
            }
            Self::TimeSync(m) => {
                b.put_u32_le(m.client_time_ms);
                b.put_u32_le(m.server_time_ms);
            }
        }
        b.freeze()
    }

    /// Build the complete frame for this message, stamped with the current
    /// wall clock.
    pub fn to_frame(&self, seq: u32) -> Bytes {
        encode_frame(self.msg_type(), seq, wall_ms(), &self.encode_payload())
    }

    pub fn decode(msg_type: u16, payload: &[u8]) -> ProtocolResult<Self> {
        let kind = MsgType::from_u16(msg_type).ok_or(ProtocolError::UnknownType(msg_type))?;
        let mut p = payload;
        let msg = match kind {
            MsgType::DiscoveryRequest => Self::DiscoveryRequest(DiscoveryRequest::decode(&mut p)?),
            MsgType::DiscoveryResponse => Self::DiscoveryResponse(DiscoveryResponse::decode(&mut p)?),
            MsgType::Hello => {
                need(&p, 4 + NAME_LEN)?;
                Self::Hello(Hello {
                    proposed_id: p.get_u32_le(),
                    name: get_fixed_str::<NAME_LEN>(&mut p)?,
                })
            }
            MsgType::HelloAck => {
                need(&p, 14)?;
                Self::HelloAck(HelloAck {
                    result: p.get_u32_le(),
                    assigned_id: p.get_u32_le(),
                    media_port: p.get_u16_le(),
                    server_time_ms: p.get_u32_le(),
                })
            }
            MsgType::Join => {
                need(&p, 2)?;
                Self::Join(Join { media_port: p.get_u16_le() })
            }
            MsgType::JoinAck => {
                need(&p, 12)?;
                Self::JoinAck(JoinAck {
                    result: p.get_u32_le(),
                    source: p.get_u32_le(),
                    base_timestamp: p.get_u32_le(),
                })
            }
            MsgType::Leave => Self::Leave,
            MsgType::Heartbeat => {
                need(&p, 4)?;
                Self::Heartbeat(Heartbeat { time_ms: p.get_u32_le() })
            }
            MsgType::AudioStart => Self::AudioStart,
            MsgType::AudioStop => Self::AudioStop,
            MsgType::AudioMute => Self::AudioMute,
            MsgType::AudioUnmute => Self::AudioUnmute,
            MsgType::PeerList => {
                need(&p, 1)?;
                let count = p.get_u8() as usize;
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(PeerRecord::decode(&mut p)?);
                }
                Self::PeerList(records)
            }
            MsgType::PeerJoin => Self::PeerJoin(PeerRecord::decode(&mut p)?),
            MsgType::PeerLeave => {
                need(&p, 4)?;
                Self::PeerLeave { id: p.get_u32_le() }
            }
            MsgType::PeerState => {
                need(&p, 7)?;
                Self::PeerState(PeerState {
                    id: p.get_u32_le(),
                    talking: p.get_u8() != 0,
                    muted: p.get_u8() != 0,
                    audio_active: p.get_u8() != 0,
                })
            }
            MsgType::TimeSync => {
                need(&p, 8)?;
                Self::TimeSync(TimeSync {
                    client_time_ms: p.get_u32_le(),
                    server_time_ms: p.get_u32_le(),
                })
            }
        };
        Ok(msg)
    }
}

pub(crate) fn need(buf: &impl Buf, n: usize) -> ProtocolResult<()> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated { need: n, have: buf.remaining() })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::CAP_VAD;

    fn roundtrip(msg: ControlMessage) {
        let frame = msg.to_frame(7);
        let mut acc = FrameAccumulator::new();
        acc.extend(&frame);
        let (header, body) = acc.next_frame().unwrap().expect("complete frame");
        assert_eq!(header.seq, 7);
        assert_eq!(header.msg_type, msg.msg_type() as u16);
        assert_eq!(header.payload_len as usize, body.len());
        let decoded = ControlMessage::decode(header.msg_type, &body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn all_messages_roundtrip() {
        roundtrip(ControlMessage::Hello(Hello { proposed_id: 0, name: "alice".into() }));
        roundtrip(ControlMessage::HelloAck(HelloAck {
            result: 0,
            assigned_id: 42,
            media_port: 6000,
            server_time_ms: 123_456,
        }));
        roundtrip(ControlMessage::Join(Join { media_port: 50_001 }));
        roundtrip(ControlMessage::JoinAck(JoinAck { result: 0, source: 42, base_timestamp: 888 }));
        roundtrip(ControlMessage::Leave);
        roundtrip(ControlMessage::Heartbeat(Heartbeat { time_ms: 99 }));
        roundtrip(ControlMessage::AudioStart);
        roundtrip(ControlMessage::AudioStop);
        roundtrip(ControlMessage::AudioMute);
        roundtrip(ControlMessage::AudioUnmute);
        roundtrip(ControlMessage::PeerList(vec![PeerRecord::test_record(1), PeerRecord::test_record(2)]));
        roundtrip(ControlMessage::PeerJoin(PeerRecord::test_record(9)));
        roundtrip(ControlMessage::PeerLeave { id: 4 });
        roundtrip(ControlMessage::PeerState(PeerState {
            id: 5,
            talking: true,
            muted: false,
            audio_active: true,
        }));
        roundtrip(ControlMessage::TimeSync(TimeSync { client_time_ms: 1, server_time_ms: 2 }));
        roundtrip(ControlMessage::DiscoveryRequest(DiscoveryRequest {
            client_id: 3,
            service_mask: 0,
            name: "probe".into(),
        }));
        roundtrip(ControlMessage::DiscoveryResponse(DiscoveryResponse {
            server_id: 10,
            tcp_port: 5000,
            media_port: 6000,
            caps: CAP_VAD,
            cur_peers: 1,
            max_peers: 16,
            name: "srv".into(),
            version: "0.1.0".into(),
        }));
    }

    #[test]
    fn accumulator_handles_partial_feeds() {
        let msg = ControlMessage::Heartbeat(Heartbeat { time_ms: 500 });
        let frame = msg.to_frame(1);
        let mut acc = FrameAccumulator::new();
        for chunk in frame.chunks(3) {
            acc.extend(chunk);
        }
        let (header, body) = acc.next_frame().unwrap().expect("complete frame");
        assert_eq!(header.kind(), Some(MsgType::Heartbeat));
        assert_eq!(ControlMessage::decode(header.msg_type, &body).unwrap(), msg);
        assert!(acc.next_frame().unwrap().is_none());
        assert!(acc.is_empty());
    }

    #[test]
    fn accumulator_pops_back_to_back_frames() {
        let a = ControlMessage::AudioMute.to_frame(1);
        let b = ControlMessage::PeerLeave { id: 2 }.to_frame(2);
        let mut acc = FrameAccumulator::new();
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        acc.extend(&joined);

        let (h1, _) = acc.next_frame().unwrap().unwrap();
        let (h2, _) = acc.next_frame().unwrap().unwrap();
        assert_eq!(h1.kind(), Some(MsgType::AudioMute));
        assert_eq!(h2.kind(), Some(MsgType::PeerLeave));
        assert!(acc.next_frame().unwrap().is_none());
    }

    #[test]
    fn bad_magic_clears_accumulator() {
        let mut acc = FrameAccumulator::new();
        acc.extend(&[0xde, 0xad, 0xbe, 0xef]);
        acc.extend(&[0u8; 32]);
        assert!(matches!(acc.next_frame(), Err(ProtocolError::BadMagic(_))));
        assert!(acc.is_empty());
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut b = BytesMut::new();
        b.put_u32_le(CONTROL_MAGIC);
        b.put_u16_le(CONTROL_VERSION);
        b.put_u16_le(MsgType::Hello as u16);
        b.put_u32_le(MAX_CONTROL_FRAME as u32); // payload alone exceeds the cap
        b.put_u32_le(0);
        b.put_u32_le(0);
        let mut acc = FrameAccumulator::new();
        acc.extend(&b);
        assert!(matches!(acc.next_frame(), Err(ProtocolError::Oversize(_))));
        assert!(acc.is_empty());
    }

    #[test]
    fn unknown_type_is_reported_not_panicked() {
        let frame = encode_frame(MsgType::Hello, 0, 0, &[]);
        // Corrupt the type field in place.
        let mut raw = frame.to_vec();
        raw[6] = 0xff;
        raw[7] = 0x00;
        let mut acc = FrameAccumulator::new();
        acc.extend(&raw);
        let (header, body) = acc.next_frame().unwrap().unwrap();
        assert_eq!(header.kind(), None);
        assert_eq!(
            ControlMessage::decode(header.msg_type, &body),
            Err(ProtocolError::UnknownType(0xff))
        );
    }
}
