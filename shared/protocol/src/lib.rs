//! Wire protocol for the voiceshare LAN voice chat.
//!
//! Two framings coexist on distinct sockets:
//! - control frames (TCP + UDP discovery): fixed 20-byte header, little-endian
//! - media frames (UDP): 16-byte RTP-style header, network order
//!
//! This crate owns the byte layouts, the typed message payloads, and the
//! sequence arithmetic shared by client and server. It does no I/O.

pub mod control;
pub mod discovery;
pub mod peer;
pub mod rtp;
pub mod seq;

use thiserror::Error;

/// Audio clock shared by every endpoint. Timestamps on media frames are
/// sample indices at this rate.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1;
pub const FRAME_MS: u32 = 20;
/// Samples per 20 ms mono frame.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

pub const MAX_PEERS: usize = 16;

pub const DEFAULT_DISCOVERY_PORT: u16 = 37020;
pub const DEFAULT_CONTROL_PORT: u16 = 5000;
pub const DEFAULT_MEDIA_PORT: u16 = 6000;

pub const HEARTBEAT_INTERVAL_SECS: u64 = 3;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 10;
pub const DISCOVERY_INTERVAL_SECS: u64 = 3;

pub const DEFAULT_CODEC_BITRATE: u32 = 32_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported version: {0}")]
    BadVersion(u16),

    #[error("unknown message type: {0}")]
    UnknownType(u16),

    #[error("frame too large: {0} bytes")]
    Oversize(usize),

    #[error("truncated payload: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Wall clock in milliseconds, truncated to u32 (the width every header and
/// timestamp field on the wire carries).
pub fn wall_ms() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32
}
