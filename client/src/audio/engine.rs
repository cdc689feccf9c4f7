//! The audio loop: one encode per capture frame into the network, one mixer
//! pull per playback frame into the output queue.
//!
//! Device bindings are external collaborators; the loops talk to them
//! through [`CaptureSource`] and [`PlaybackSink`]. Timing on the playout
//! side is locked to the sink — the jitter buffers never schedule
//! themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use vs_protocol::rtp::MAX_MEDIA_PAYLOAD;

use crate::audio::codec::Encoder;
use crate::audio::gate::CaptureGate;
use crate::audio::mixer::Mixer;
use crate::net::media::MediaChannel;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub frame_samples: usize,
    pub frame_ms: u64,
}

pub trait CaptureSource: Send {
    /// Fill `out` with one frame; false when no frame is ready yet.
    fn read_frame(&mut self, out: &mut [i16]) -> bool;
}

pub trait PlaybackSink: Send {
    /// Queue one frame on the output device. The device's consumption rate
    /// is the playout clock.
    fn write_frame(&mut self, pcm: &[i16]);
}

/// Stand-ins wired up when no real device binding is supplied.
pub struct SilentSource;

impl CaptureSource for SilentSource {
    fn read_frame(&mut self, out: &mut [i16]) -> bool {
        out.fill(0);
        true
    }
}

pub struct DiscardSink;

impl PlaybackSink for DiscardSink {
    fn write_frame(&mut self, _pcm: &[i16]) {}
}

/// Capture tick: read → gate → encode → one RTP datagram.
///
/// The timestamp advances by the frame's sample count for every captured
/// frame, muted or not, so the receive side sees a continuous sample clock.
/// The sequence only advances for frames actually sent.
pub async fn run_capture(
    cfg: EngineConfig,
    mut source: impl CaptureSource,
    mut gate: CaptureGate,
    mut encoder: Box<dyn Encoder>,
    media: MediaChannel,
    muted: Arc<AtomicBool>,
    base_timestamp: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pcm = vec![0i16; cfg.frame_samples];
    let mut encoded = vec![0u8; MAX_MEDIA_PAYLOAD];
    let mut seq: u16 = 0;
    let mut timestamp = base_timestamp;
    let mut gate_open = true;

    let mut tick = tokio::time::interval(Duration::from_millis(cfg.frame_ms));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                if !source.read_frame(&mut pcm) {
                    continue;
                }
                let analysis = gate.process(&mut pcm);
                timestamp = timestamp.wrapping_add(cfg.frame_samples as u32);

                let open = gate.gain() > 0.5;
                if open != gate_open {
                    debug!(
                        gain = gate.gain(),
                        rms_db = analysis.rms_db,
                        zcr = analysis.zcr,
                        high_energy = analysis.is_high_energy,
                        voice = analysis.is_likely_voice,
                        "capture gate {}",
                        if open { "opened" } else { "closed" }
                    );
                    gate_open = open;
                }

                if muted.load(Ordering::Relaxed) {
                    continue;
                }
                let n = match encoder.encode(&pcm, &mut encoded) {
                    Ok(n) if n <= MAX_MEDIA_PAYLOAD => n,
                    Ok(n) => {
                        trace!(n, "encoded frame exceeds the payload cap, dropping");
                        continue;
                    }
                    Err(e) => {
                        debug!("encode failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = media.send_frame(seq, timestamp, !analysis.is_silence, &encoded[..n]) {
                    trace!("media send failed: {e}");
                }
                seq = seq.wrapping_add(1);
            }
        }
    }
    debug!("capture loop stopped");
}

/// Playback tick: pull one mixed frame into the sink; sleep briefly on a dry
/// pull. Also hosts the mixer's once-a-second idle sweep.
pub async fn run_playback(
    mixer: Arc<Mixer>,
    mut sink: impl PlaybackSink,
    frame_samples: usize,
    shutdown: watch::Receiver<bool>,
) {
    let mut out = vec![0i16; frame_samples];
    let mut last_sweep = Instant::now();
    loop {
        if *shutdown.borrow() {
            break;
        }
        if last_sweep.elapsed() > Duration::from_secs(1) {
            mixer.sweep();
            last_sweep = Instant::now();
        }
        let n = mixer.pull_mixed(&mut out);
        if n == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }
        sink.write_frame(&out[..n]);
        tokio::task::yield_now().await;
    }
    debug!("playback loop stopped");
}
