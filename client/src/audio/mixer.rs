//! Multi-source mix-down.
//!
//! One table of per-source stream entries, each owning a jitter buffer and
//! a decoder from the session's codec factory. Every playback tick pulls at
//! most one frame per active source and sums them into a 32-bit accumulator,
//! saturating to i16 on the way out. A single lock covers the entry table
//! and the buffers inside it; insert, pull, and the idle sweep serialize
//! against each other.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use vs_protocol::rtp::MediaHeader;
use vs_protocol::{FRAME_SAMPLES, MAX_PEERS};

use crate::audio::codec::{Decoder, SharedFactory};
use crate::audio::jitter::{JitterBuffer, JitterConfig, JitterStats};

/// Idle streams are reclaimed after this long without a frame.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct MixerConfig {
    pub max_streams: usize,
    pub frame_samples: usize,
    pub idle_timeout: Duration,
    pub jitter: JitterConfig,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_streams: MAX_PEERS,
            frame_samples: FRAME_SAMPLES,
            idle_timeout: STREAM_IDLE_TIMEOUT,
            jitter: JitterConfig::default(),
        }
    }
}

struct StreamEntry {
    source: u32,
    jb: JitterBuffer,
    decoder: Box<dyn Decoder>,
    last_active: Instant,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamStats {
    pub source: u32,
    pub stats: JitterStats,
    pub jitter_ms: f32,
}

struct Inner {
    entries: Vec<Option<StreamEntry>>,
    accumulator: Vec<i32>,
    scratch: Vec<i16>,
}

pub struct Mixer {
    cfg: MixerConfig,
    factory: SharedFactory,
    /// Our own source id; frames relayed back to us are skipped. 0 = unset.
    self_source: AtomicU32,
    inner: Mutex<Inner>,
}

impl Mixer {
    pub fn new(cfg: MixerConfig, factory: SharedFactory) -> Self {
        let inner = Inner {
            entries: (0..cfg.max_streams).map(|_| None).collect(),
            accumulator: vec![0; cfg.frame_samples],
            scratch: vec![0; cfg.frame_samples],
        };
        Self { cfg, factory, self_source: AtomicU32::new(0), inner: Mutex::new(inner) }
    }

    pub fn set_self_source(&self, source: u32) {
        self.self_source.store(source, Ordering::Relaxed);
    }

    pub fn active_streams(&self) -> usize {
        self.inner.lock().entries.iter().flatten().count()
    }

    /// Per-stream receive statistics, for the session log.
    pub fn stream_stats(&self) -> Vec<StreamStats> {
        self.inner
            .lock()
            .entries
            .iter()
            .flatten()
            .map(|e| StreamStats {
                source: e.source,
                stats: e.jb.stats(),
                jitter_ms: e.jb.jitter_ms(),
            })
            .collect()
    }

    /// Route one received frame to its source's jitter buffer, creating or
    /// evicting stream entries as needed.
    pub fn insert(&self, header: &MediaHeader, payload: &[u8]) {
        if header.source == self.self_source.load(Ordering::Relaxed) {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().flatten().find(|e| e.source == header.source) {
            entry.last_active = Instant::now();
            entry.jb.insert(header.seq, header.timestamp, header.source, payload);
            return;
        }

        let idx = match inner.entries.iter().position(|e| e.is_none()) {
            Some(idx) => idx,
            None => {
                // Table full: evict the stream idle the longest. Its decoder
                // and buffer are destroyed before the replacement exists.
                let idx = inner
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.as_ref().map(|e| (i, e.last_active)))
                    .min_by_key(|(_, t)| *t)
                    .map(|(i, _)| i)
                    .expect("full table has entries");
                let evicted = inner.entries[idx].take().expect("entry present");
                debug!(source = evicted.source, "evicting idle stream for {}", header.source);
                drop(evicted);
                idx
            }
        };

        let decoder = match self.factory.new_decoder() {
            Ok(d) => d,
            Err(e) => {
                warn!(source = header.source, "decoder creation failed: {e}");
                return;
            }
        };
        debug!(
            source = header.source,
            target_ms = self.cfg.jitter.target_ms,
            min_ms = self.cfg.jitter.min_ms,
            max_ms = self.cfg.jitter.max_ms,
            "new inbound stream"
        );
        let mut entry = StreamEntry {
            source: header.source,
            jb: JitterBuffer::new(self.cfg.jitter.clone()),
            decoder,
            last_active: Instant::now(),
        };
        entry.jb.insert(header.seq, header.timestamp, header.source, payload);
        inner.entries[idx] = Some(entry);
    }

    /// Pull one frame from every active stream and sum. Returns the number
    /// of samples written into `out` (0 = nothing to play this tick).
    pub fn pull_mixed(&self, out: &mut [i16]) -> usize {
        let mut inner = self.inner.lock();
        let Inner { entries, accumulator, scratch } = &mut *inner;

        accumulator.fill(0);
        let mut mixed = 0usize;
        for entry in entries.iter_mut().flatten() {
            let Some(kind) = entry.jb.emit(entry.decoder.as_mut(), scratch) else {
                continue;
            };
            let n = kind.samples().min(accumulator.len());
            for i in 0..n {
                accumulator[i] += scratch[i] as i32;
            }
            mixed = mixed.max(n);
        }

        let n = mixed.min(out.len());
        for i in 0..n {
            out[i] = accumulator[i].clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        n
    }

    /// Reclaim streams that have gone quiet.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.last_active.elapsed() > self.cfg.idle_timeout {
                    debug!(source = entry.source, "stream idle, releasing");
                    *slot = None;
                }
            }
        }
    }

    /// Destroy every stream (session teardown).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.entries.iter_mut() {
            *slot = None;
        }
        self.self_source.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;

    use crate::audio::codec::{CodecFactory, Encoder, RawPcmCodec, RawPcmFactory};

    const FRAME: usize = 4;

    fn cfg() -> MixerConfig {
        MixerConfig {
            max_streams: 4,
            frame_samples: FRAME,
            idle_timeout: STREAM_IDLE_TIMEOUT,
            jitter: JitterConfig { frame_samples: FRAME, ..JitterConfig::default() },
        }
    }

    fn mixer() -> Mixer {
        Mixer::new(cfg(), Arc::new(RawPcmFactory { frame_samples: FRAME }))
    }

    fn header(source: u32, seq: u16) -> MediaHeader {
        MediaHeader {
            payload_type: vs_protocol::rtp::PT_RAW_PCM,
            seq,
            timestamp: 960 * seq as u32,
            source,
            payload_len: (FRAME * 2) as u16,
            flags: 0,
        }
    }

    fn pcm_payload(sample: i16) -> Vec<u8> {
        let mut p = Vec::new();
        for _ in 0..FRAME {
            p.extend_from_slice(&sample.to_le_bytes());
        }
        p
    }

    #[test]
    fn two_sources_sum_samplewise() {
        let m = mixer();
        m.insert(&header(1, 10), &pcm_payload(100));
        m.insert(&header(2, 77), &pcm_payload(-30));

        let mut out = [0i16; FRAME];
        assert_eq!(m.pull_mixed(&mut out), FRAME);
        assert_eq!(out, [70i16; FRAME]);
        assert_eq!(m.active_streams(), 2);
    }

    #[test]
    fn output_saturates_to_i16() {
        let m = mixer();
        m.insert(&header(1, 0), &pcm_payload(i16::MAX));
        m.insert(&header(2, 0), &pcm_payload(i16::MAX));
        m.insert(&header(3, 0), &pcm_payload(i16::MAX));

        let mut out = [0i16; FRAME];
        assert_eq!(m.pull_mixed(&mut out), FRAME);
        assert_eq!(out, [i16::MAX; FRAME]);

        m.insert(&header(1, 1), &pcm_payload(i16::MIN));
        m.insert(&header(2, 1), &pcm_payload(i16::MIN));
        assert_eq!(m.pull_mixed(&mut out), FRAME);
        assert_eq!(out, [i16::MIN; FRAME]);
    }

    #[test]
    fn own_source_is_skipped() {
        let m = mixer();
        m.set_self_source(42);
        m.insert(&header(42, 0), &pcm_payload(100));
        assert_eq!(m.active_streams(), 0);
        let mut out = [0i16; FRAME];
        assert_eq!(m.pull_mixed(&mut out), 0);
    }

    #[test]
    fn one_frame_per_source_per_tick() {
        let m = mixer();
        m.insert(&header(1, 0), &pcm_payload(10));
        m.insert(&header(1, 1), &pcm_payload(20));

        let mut out = [0i16; FRAME];
        assert_eq!(m.pull_mixed(&mut out), FRAME);
        assert_eq!(out[0], 10);
        assert_eq!(m.pull_mixed(&mut out), FRAME);
        assert_eq!(out[0], 20);
        assert_eq!(m.pull_mixed(&mut out), 0);
    }

    /// Factory that logs decoder lifecycle so eviction ordering is visible.
    struct TracingFactory {
        events: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    struct TracingDecoder {
        inner: RawPcmCodec,
        events: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Decoder for TracingDecoder {
        fn decode(&mut self, payload: &[u8], pcm_out: &mut [i16]) -> Result<usize> {
            self.inner.decode(payload, pcm_out)
        }
        fn conceal(&mut self, pcm_out: &mut [i16]) -> Result<usize> {
            self.inner.conceal(pcm_out)
        }
    }

    impl Drop for TracingDecoder {
        fn drop(&mut self) {
            self.events.lock().push("drop".into());
        }
    }

    impl CodecFactory for TracingFactory {
        fn new_encoder(&self) -> Result<Box<dyn Encoder>> {
            Ok(Box::new(RawPcmCodec::new(FRAME)))
        }
        fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
            self.events.lock().push("create".into());
            Ok(Box::new(TracingDecoder {
                inner: RawPcmCodec::new(FRAME),
                events: self.events.clone(),
            }))
        }
    }

    #[test]
    fn eviction_destroys_the_old_decoder_before_creating_the_new() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let m = Mixer::new(
            MixerConfig { max_streams: 1, ..cfg() },
            Arc::new(TracingFactory { events: events.clone() }),
        );

        m.insert(&header(1, 0), &pcm_payload(1));
        m.insert(&header(2, 0), &pcm_payload(2));
        assert_eq!(events.lock().as_slice(), &["create", "drop", "create"]);
        assert_eq!(m.active_streams(), 1);
    }

    #[test]
    fn sweep_releases_idle_streams() {
        let m = Mixer::new(
            MixerConfig { idle_timeout: Duration::from_millis(1), ..cfg() },
            Arc::new(RawPcmFactory { frame_samples: FRAME }),
        );
        m.insert(&header(1, 0), &pcm_payload(5));
        assert_eq!(m.active_streams(), 1);
        std::thread::sleep(Duration::from_millis(5));
        m.sweep();
        assert_eq!(m.active_streams(), 0);
    }

    #[test]
    fn reset_destroys_everything() {
        let m = mixer();
        m.set_self_source(9);
        m.insert(&header(1, 0), &pcm_payload(5));
        m.insert(&header(2, 0), &pcm_payload(5));
        m.reset();
        assert_eq!(m.active_streams(), 0);
    }
}
