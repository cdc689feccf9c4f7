//! Media framing: one RTP-style frame per UDP datagram.
//!
//! Flat 16-byte header in network byte order, then the payload. No CSRC
//! list, no extensions. Datagrams shorter than the header or with an
//! unexpected version are discarded by the caller.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProtocolError, ProtocolResult};

pub const MEDIA_VERSION: u8 = 2;
pub const MEDIA_HEADER_LEN: usize = 16;
pub const MAX_MEDIA_PAYLOAD: usize = 512;
pub const MAX_MEDIA_DATAGRAM: usize = MEDIA_HEADER_LEN + MAX_MEDIA_PAYLOAD;

/// Linear PCM, reserved (used by the built-in raw codec).
pub const PT_RAW_PCM: u8 = 0;
/// The encoded voice payload.
pub const PT_VOICE: u8 = 111;

/// Marker bit; unused by the core.
pub const FLAG_MARKER: u16 = 1;
/// Set when the capture gate classified the frame as containing speech.
pub const FLAG_VOICE: u16 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaHeader {
    pub payload_type: u8,
    /// Modulo 2^16, signed-delta comparison (see [`crate::seq`]).
    pub seq: u16,
    /// Sample index at the 48 kHz clock.
    pub timestamp: u32,
    pub source: u32,
    pub payload_len: u16,
    pub flags: u16,
}

impl MediaHeader {
    pub fn has_voice(&self) -> bool {
        self.flags & FLAG_VOICE != 0
    }

    pub fn encode(&self, b: &mut BytesMut) {
        b.put_u8(MEDIA_VERSION);
        b.put_u8(self.payload_type);
        b.put_u16(self.seq);
        b.put_u32(self.timestamp);
        b.put_u32(self.source);
        b.put_u16(self.payload_len);
        b.put_u16(self.flags);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtocolResult<Self> {
        if buf.remaining() < MEDIA_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                need: MEDIA_HEADER_LEN,
                have: buf.remaining(),
            });
        }
        let version = buf.get_u8();
        if version != MEDIA_VERSION {
            return Err(ProtocolError::BadVersion(version as u16));
        }
        Ok(Self {
            payload_type: buf.get_u8(),
            seq: buf.get_u16(),
            timestamp: buf.get_u32(),
            source: buf.get_u32(),
            payload_len: buf.get_u16(),
            flags: buf.get_u16(),
        })
    }
}

/// Build one complete media datagram.
pub fn encode_datagram(header: &MediaHeader, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_MEDIA_PAYLOAD);
    debug_assert_eq!(header.payload_len as usize, payload.len());
    let mut b = BytesMut::with_capacity(MEDIA_HEADER_LEN + payload.len());
    header.encode(&mut b);
    b.extend_from_slice(payload);
    b.freeze()
}

/// Split one received datagram into header + payload.
///
/// Rejects short datagrams, version mismatches, and payloads that do not
/// match the advertised length.
pub fn decode_datagram(datagram: &[u8]) -> ProtocolResult<(MediaHeader, &[u8])> {
    let mut buf = datagram;
    let header = MediaHeader::decode(&mut buf)?;
    let want = header.payload_len as usize;
    if buf.len() < want {
        return Err(ProtocolError::Truncated { need: want, have: buf.len() });
    }
    Ok((header, &buf[..want]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16) -> MediaHeader {
        MediaHeader {
            payload_type: PT_VOICE,
            seq,
            timestamp: 960 * seq as u32,
            source: 42,
            payload_len: 3,
            flags: FLAG_VOICE,
        }
    }

    #[test]
    fn datagram_roundtrip_is_bit_exact() {
        let h = header(100);
        let d = encode_datagram(&h, &[1, 2, 3]);
        assert_eq!(d.len(), MEDIA_HEADER_LEN + 3);
        let (decoded, payload) = decode_datagram(&d).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(payload, &[1, 2, 3]);
        assert!(decoded.has_voice());
    }

    #[test]
    fn short_datagram_rejected() {
        let d = encode_datagram(&header(1), &[9, 9, 9]);
        assert!(decode_datagram(&d[..MEDIA_HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn version_mismatch_rejected() {
        let d = encode_datagram(&header(1), &[9, 9, 9]);
        let mut raw = d.to_vec();
        raw[0] = 1;
        assert!(matches!(decode_datagram(&raw), Err(ProtocolError::BadVersion(1))));
    }

    #[test]
    fn payload_shorter_than_advertised_rejected() {
        let d = encode_datagram(&header(1), &[9, 9, 9]);
        assert!(decode_datagram(&d[..d.len() - 1]).is_err());
    }
}
