//! Fixed-size peer records carried by PEER_LIST / PEER_JOIN.

use bytes::{Buf, BufMut, BytesMut};

use crate::control::need;
use crate::ProtocolResult;

/// NUL-padded name field width.
pub const NAME_LEN: usize = 32;
/// NUL-padded dotted-quad field width.
pub const IP_LEN: usize = 16;
/// id + source + name + ip + port + 4 flag bytes.
pub const PEER_RECORD_LEN: usize = 4 + 4 + NAME_LEN + IP_LEN + 2 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: u32,
    pub source: u32,
    pub name: String,
    /// Dotted-quad string of the peer's media address.
    pub ip: String,
    pub udp_port: u16,
    pub talking: bool,
    pub muted: bool,
    pub audio_active: bool,
    pub peer_type: u8,
}

impl PeerRecord {
    pub fn encode(&self, b: &mut BytesMut) {
        b.put_u32_le(self.id);
        b.put_u32_le(self.source);
        put_fixed_str::<NAME_LEN>(b, &self.name);
        put_fixed_str::<IP_LEN>(b, &self.ip);
        b.put_u16_le(self.udp_port);
        b.put_u8(self.talking as u8);
        b.put_u8(self.muted as u8);
        b.put_u8(self.audio_active as u8);
        b.put_u8(self.peer_type);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtocolResult<Self> {
        need(buf, PEER_RECORD_LEN)?;
        Ok(Self {
            id: buf.get_u32_le(),
            source: buf.get_u32_le(),
            name: get_fixed_str::<NAME_LEN>(buf)?,
            ip: get_fixed_str::<IP_LEN>(buf)?,
            udp_port: buf.get_u16_le(),
            talking: buf.get_u8() != 0,
            muted: buf.get_u8() != 0,
            audio_active: buf.get_u8() != 0,
            peer_type: buf.get_u8(),
        })
    }
}

#[cfg(test)]
impl PeerRecord {
    pub(crate) fn test_record(id: u32) -> Self {
        Self {
            id,
            source: id,
            name: format!("peer-{id}"),
            ip: "192.168.1.10".into(),
            udp_port: 6000,
            talking: false,
            muted: false,
            audio_active: true,
            peer_type: 0,
        }
    }
}

/// Write `s` into an N-byte NUL-padded field, truncating if needed and always
/// keeping at least one trailing NUL.
pub(crate) fn put_fixed_str<const N: usize>(b: &mut BytesMut, s: &str) {
    let mut field = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    b.extend_from_slice(&field);
}

/// Read an N-byte NUL-padded field back into a String.
pub(crate) fn get_fixed_str<const N: usize>(buf: &mut impl Buf) -> ProtocolResult<String> {
    need(buf, N)?;
    let mut field = [0u8; N];
    buf.copy_to_slice(&mut field);
    let end = field.iter().position(|&b| b == 0).unwrap_or(N);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}
