//! Discovery request/response payloads.
//!
//! Both directions reuse the control-header framing, carried over the
//! broadcast UDP discovery socket. Discovery has no session state.

use bytes::{Buf, BufMut, BytesMut};

use crate::control::need;
use crate::peer::{get_fixed_str, put_fixed_str, NAME_LEN};
use crate::ProtocolResult;

/// Capability bits advertised in a discovery response.
pub const CAP_CODEC: u32 = 1;
pub const CAP_VAD: u32 = 1 << 1;
pub const CAP_JITTER: u32 = 1 << 2;

/// NUL-padded version string field width.
pub const VERSION_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub client_id: u32,
    /// Reserved; always 0.
    pub service_mask: u32,
    pub name: String,
}

impl DiscoveryRequest {
    pub fn encode(&self, b: &mut BytesMut) {
        b.put_u32_le(self.client_id);
        b.put_u32_le(self.service_mask);
        put_fixed_str::<NAME_LEN>(b, &self.name);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtocolResult<Self> {
        need(buf, 8 + NAME_LEN)?;
        Ok(Self {
            client_id: buf.get_u32_le(),
            service_mask: buf.get_u32_le(),
            name: get_fixed_str::<NAME_LEN>(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub server_id: u32,
    pub tcp_port: u16,
    pub media_port: u16,
    pub caps: u32,
    pub cur_peers: u16,
    pub max_peers: u16,
    pub name: String,
    pub version: String,
}

impl DiscoveryResponse {
    pub fn encode(&self, b: &mut BytesMut) {
        b.put_u32_le(self.server_id);
        b.put_u16_le(self.tcp_port);
        b.put_u16_le(self.media_port);
        b.put_u32_le(self.caps);
        b.put_u16_le(self.cur_peers);
        b.put_u16_le(self.max_peers);
        put_fixed_str::<NAME_LEN>(b, &self.name);
        put_fixed_str::<VERSION_LEN>(b, &self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtocolResult<Self> {
        need(buf, 16 + NAME_LEN + VERSION_LEN)?;
        Ok(Self {
            server_id: buf.get_u32_le(),
            tcp_port: buf.get_u16_le(),
            media_port: buf.get_u16_le(),
            caps: buf.get_u32_le(),
            cur_peers: buf.get_u16_le(),
            max_peers: buf.get_u16_le(),
            name: get_fixed_str::<NAME_LEN>(buf)?,
            version: get_fixed_str::<VERSION_LEN>(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_roundtrip() {
        let r = DiscoveryResponse {
            server_id: 11,
            tcp_port: 5000,
            media_port: 6000,
            caps: CAP_CODEC | CAP_VAD | CAP_JITTER,
            cur_peers: 3,
            max_peers: 16,
            name: "lan-server".into(),
            version: "0.1.0".into(),
        };
        let mut b = BytesMut::new();
        r.encode(&mut b);
        assert_eq!(DiscoveryResponse::decode(&mut b.freeze()).unwrap(), r);
    }
}
