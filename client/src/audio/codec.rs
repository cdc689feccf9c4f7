//! The codec seam.
//!
//! The real voice codec (payload type 111) is provided from outside the
//! core; the pipeline only sees these traits. [`RawPcmCodec`] is the
//! built-in linear-PCM implementation (payload type 0), good enough for
//! tests and codec-less operation at short frame sizes.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use vs_protocol::rtp::PT_RAW_PCM;

pub trait Encoder: Send {
    /// Encode one PCM frame into `out`; returns the encoded byte count.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;

    fn payload_type(&self) -> u8;
}

pub trait Decoder: Send {
    /// Decode one payload into `pcm_out`; returns the sample count.
    fn decode(&mut self, payload: &[u8], pcm_out: &mut [i16]) -> Result<usize>;

    /// Synthesize one frame of concealment audio for a lost packet;
    /// returns the sample count.
    fn conceal(&mut self, pcm_out: &mut [i16]) -> Result<usize>;
}

/// Creates per-stream codec state. The mixer makes one decoder per source;
/// the capture path makes one encoder per session.
pub trait CodecFactory: Send + Sync {
    fn new_encoder(&self) -> Result<Box<dyn Encoder>>;
    fn new_decoder(&self) -> Result<Box<dyn Decoder>>;
}

pub type SharedFactory = Arc<dyn CodecFactory>;

/// Linear 16-bit PCM, little-endian on the wire. Concealment repeats
/// nothing — it emits one frame of silence at the stream's frame size.
pub struct RawPcmCodec {
    frame_samples: usize,
}

impl RawPcmCodec {
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples }
    }
}

impl Encoder for RawPcmCodec {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let bytes = pcm.len() * 2;
        if bytes > out.len() {
            return Err(anyhow!("pcm frame of {} samples does not fit {} bytes", pcm.len(), out.len()));
        }
        for (i, &s) in pcm.iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
        }
        Ok(bytes)
    }

    fn payload_type(&self) -> u8 {
        PT_RAW_PCM
    }
}

impl Decoder for RawPcmCodec {
    fn decode(&mut self, payload: &[u8], pcm_out: &mut [i16]) -> Result<usize> {
        if payload.len() % 2 != 0 {
            return Err(anyhow!("odd pcm payload length {}", payload.len()));
        }
        let samples = payload.len() / 2;
        if samples > pcm_out.len() {
            return Err(anyhow!("pcm payload of {samples} samples does not fit the frame"));
        }
        for i in 0..samples {
            pcm_out[i] = i16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
        }
        Ok(samples)
    }

    fn conceal(&mut self, pcm_out: &mut [i16]) -> Result<usize> {
        let n = self.frame_samples.min(pcm_out.len());
        pcm_out[..n].fill(0);
        Ok(n)
    }
}

pub struct RawPcmFactory {
    pub frame_samples: usize,
}

impl CodecFactory for RawPcmFactory {
    fn new_encoder(&self) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(RawPcmCodec::new(self.frame_samples)))
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(RawPcmCodec::new(self.frame_samples)))
    }
}
