//! Single-stream jitter buffer.
//!
//! A fixed-length circular timeline of slots indexed by the low bits of the
//! sequence number: slot = (head + (seq − next_seq)) mod N. Inserts may
//! arrive out of order; emit produces exactly one frame per playback tick,
//! substituting concealment audio for anything that never arrived.
//!
//! Warm-up policy is quick-start: the buffer emits as soon as the first
//! insert has initialized the timeline, trading one frame of delay for
//! minimum latency.

use std::time::Instant;

use tracing::warn;

use vs_protocol::seq::seq_delta;
use vs_protocol::{FRAME_SAMPLES, SAMPLE_RATE};

use crate::audio::codec::Decoder;

pub const DEFAULT_SLOTS: usize = 16;

#[derive(Clone, Debug)]
pub struct JitterConfig {
    pub slots: usize,
    pub frame_samples: usize,
    pub sample_rate: u32,
    /// Target/min/max playout delay. Retained for the adaptive extension;
    /// the quick-start policy does not gate on them.
    pub target_ms: u32,
    pub min_ms: u32,
    pub max_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            frame_samples: FRAME_SAMPLES,
            sample_rate: SAMPLE_RATE,
            target_ms: 20,
            min_ms: 10,
            max_ms: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Filled,
    Decoded,
}

struct Slot {
    state: SlotState,
    seq: u16,
    timestamp: u32,
    source: u32,
    payload: Vec<u8>,
    pcm: Vec<i16>,
    pcm_len: usize,
    arrival: Instant,
}

impl Slot {
    fn new(frame_samples: usize) -> Self {
        Self {
            state: SlotState::Empty,
            seq: 0,
            timestamp: 0,
            source: 0,
            payload: Vec::new(),
            pcm: vec![0; frame_samples],
            pcm_len: 0,
            arrival: Instant::now(),
        }
    }

    fn clear(&mut self) {
        self.state = SlotState::Empty;
        self.payload.clear();
        self.pcm_len = 0;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JitterStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub reordered: u64,
    pub duplicates: u64,
    pub overruns: u64,
    pub concealed: u64,
}

impl JitterStats {
    pub fn loss_rate(&self) -> f32 {
        let denom = self.received + self.lost;
        if denom == 0 {
            0.0
        } else {
            self.lost as f32 / denom as f32
        }
    }
}

/// What one emit produced; the sample count is how much of the caller's
/// buffer was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitKind {
    Decoded(usize),
    Concealed(usize),
}

impl EmitKind {
    pub fn samples(&self) -> usize {
        match self {
            Self::Decoded(n) | Self::Concealed(n) => *n,
        }
    }
}

pub struct JitterBuffer {
    cfg: JitterConfig,
    slots: Vec<Slot>,
    /// Next slot to emit. Advances exactly once per emit, in lockstep with
    /// `next_seq`.
    head: usize,
    filled: usize,
    next_seq: u16,
    initialized: bool,
    last_arrival: Option<Instant>,
    last_timestamp: u32,
    jitter_ms: f32,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(cfg: JitterConfig) -> Self {
        let slots = (0..cfg.slots).map(|_| Slot::new(cfg.frame_samples)).collect();
        Self {
            slots,
            head: 0,
            filled: 0,
            next_seq: 0,
            initialized: false,
            last_arrival: None,
            last_timestamp: 0,
            jitter_ms: 0.0,
            stats: JitterStats::default(),
            cfg,
        }
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    /// Accept one frame off the wire.
    pub fn insert(&mut self, seq: u16, timestamp: u32, source: u32, payload: &[u8]) {
        if !self.initialized {
            self.next_seq = seq;
            self.initialized = true;
        }

        let delta = seq_delta(seq, self.next_seq) as i32;
        let n = self.cfg.slots as i32;
        if delta < 0 {
            // Arrived after its playout tick passed; the slot it would take
            // lies behind the head and can never be emitted.
            self.stats.late += 1;
            return;
        }
        if delta >= n {
            self.stats.overruns += 1;
            return;
        }

        let idx = (self.head + delta as usize) % self.cfg.slots;
        let arrival = Instant::now();
        let slot = &mut self.slots[idx];
        if slot.state != SlotState::Empty {
            if slot.seq == seq {
                self.stats.duplicates += 1;
            } else {
                warn!(
                    slot_seq = slot.seq,
                    slot_source = slot.source,
                    age_ms = slot.arrival.elapsed().as_millis() as u64,
                    seq,
                    "occupied jitter slot mismatch, dropping frame"
                );
            }
            return;
        }

        slot.state = SlotState::Filled;
        slot.seq = seq;
        slot.timestamp = timestamp;
        slot.source = source;
        slot.payload.clear();
        slot.payload.extend_from_slice(payload);
        slot.arrival = arrival;
        self.filled += 1;
        self.stats.received += 1;
        if delta != 0 {
            self.stats.reordered += 1;
        }

        self.update_jitter(arrival, timestamp);
    }

    /// Interarrival jitter, RFC-3550 style: an exponential moving average of
    /// |Δarrival − Δtimestamp| with gain 1/16.
    fn update_jitter(&mut self, arrival: Instant, timestamp: u32) {
        if let Some(last) = self.last_arrival {
            let d_arrival_ms = arrival.duration_since(last).as_secs_f32() * 1000.0;
            let d_ts_ms = timestamp.wrapping_sub(self.last_timestamp) as i32 as f32 * 1000.0
                / self.cfg.sample_rate as f32;
            let deviation = (d_arrival_ms - d_ts_ms).abs();
            self.jitter_ms += (deviation - self.jitter_ms) / 16.0;
        }
        self.last_arrival = Some(arrival);
        self.last_timestamp = timestamp;
    }

    /// Produce the next frame, once per playback tick.
    ///
    /// Returns `None` before the first insert and on whole-stream underflow
    /// (the caller plays silence); otherwise exactly one decoded or
    /// concealed frame, and the head advances by one.
    pub fn emit(&mut self, decoder: &mut dyn Decoder, out: &mut [i16]) -> Option<EmitKind> {
        if !self.initialized || self.filled == 0 {
            return None;
        }

        let head = self.head;
        let state = self.slots[head].state;
        let kind = match state {
            SlotState::Empty => EmitKind::Concealed(self.conceal(decoder, out)),
            SlotState::Filled | SlotState::Decoded => {
                let slot = &mut self.slots[head];
                if slot.seq != self.next_seq {
                    // The timeline no longer lines up; start over rather
                    // than emit the wrong stream position.
                    warn!(
                        slot_seq = slot.seq,
                        slot_ts = slot.timestamp,
                        next_seq = self.next_seq,
                        "jitter slot out of step, resetting buffer"
                    );
                    self.reset();
                    return None;
                }
                match decoder.decode(&slot.payload, &mut slot.pcm) {
                    Ok(samples) => {
                        slot.state = SlotState::Decoded;
                        slot.pcm_len = samples;
                        let n = slot.pcm_len.min(out.len());
                        out[..n].copy_from_slice(&slot.pcm[..n]);
                        self.slots[head].clear();
                        self.filled -= 1;
                        EmitKind::Decoded(n)
                    }
                    Err(_) => {
                        // Undecodable payload counts as a loss; conceal it.
                        self.slots[head].clear();
                        self.filled -= 1;
                        EmitKind::Concealed(self.conceal(decoder, out))
                    }
                }
            }
        };

        self.head = (self.head + 1) % self.cfg.slots;
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(kind)
    }

    fn conceal(&mut self, decoder: &mut dyn Decoder, out: &mut [i16]) -> usize {
        self.stats.lost += 1;
        self.stats.concealed += 1;
        match decoder.conceal(out) {
            Ok(n) => n,
            Err(_) => {
                let n = self.cfg.frame_samples.min(out.len());
                out[..n].fill(0);
                n
            }
        }
    }

    /// Drop the whole timeline and start over on the next insert. Statistics
    /// survive the reset.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.head = 0;
        self.filled = 0;
        self.initialized = false;
        self.last_arrival = None;
        self.jitter_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::RawPcmCodec;

    const FRAME: usize = 4;

    fn buffer() -> JitterBuffer {
        JitterBuffer::new(JitterConfig {
            slots: 16,
            frame_samples: FRAME,
            ..JitterConfig::default()
        })
    }

    fn decoder() -> RawPcmCodec {
        RawPcmCodec::new(FRAME)
    }

    /// A payload whose samples all carry the sequence number, so decoded
    /// output identifies the frame it came from.
    fn payload_for(seq: u16) -> Vec<u8> {
        let sample = seq as i16;
        let mut p = Vec::with_capacity(FRAME * 2);
        for _ in 0..FRAME {
            p.extend_from_slice(&sample.to_le_bytes());
        }
        p
    }

    fn insert(jb: &mut JitterBuffer, seq: u16) {
        jb.insert(seq, 960u32.wrapping_mul(seq as u32), 1, &payload_for(seq));
    }

    #[test]
    fn ordered_stream_emits_every_frame_without_loss() {
        let mut jb = buffer();
        let mut dec = decoder();
        for seq in 100..116 {
            insert(&mut jb, seq);
        }
        let mut out = [0i16; FRAME];
        for seq in 100..116u16 {
            match jb.emit(&mut dec, &mut out) {
                Some(EmitKind::Decoded(n)) => {
                    assert_eq!(n, FRAME);
                    assert_eq!(out[0], seq as i16);
                }
                other => panic!("expected decoded frame for {seq}, got {other:?}"),
            }
        }
        let stats = jb.stats();
        assert_eq!(stats.received, 16);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.reordered, 0);
        assert_eq!(stats.loss_rate(), 0.0);
    }

    #[test]
    fn gap_is_concealed_in_place() {
        let mut jb = buffer();
        let mut dec = decoder();
        for seq in [100u16, 101, 103, 104] {
            insert(&mut jb, seq);
        }
        let mut out = [0i16; FRAME];
        let kinds: Vec<_> = (0..5).map(|_| jb.emit(&mut dec, &mut out).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                EmitKind::Decoded(FRAME),
                EmitKind::Decoded(FRAME),
                EmitKind::Concealed(FRAME),
                EmitKind::Decoded(FRAME),
                EmitKind::Decoded(FRAME),
            ]
        );
        let stats = jb.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.received, 4);
        assert!(stats.loss_rate() > 0.0);
    }

    #[test]
    fn sequence_wrap_is_contiguous() {
        let mut jb = buffer();
        let mut dec = decoder();
        for seq in [65534u16, 65535, 0, 1] {
            insert(&mut jb, seq);
        }
        let mut out = [0i16; FRAME];
        for _ in 0..4 {
            assert!(matches!(jb.emit(&mut dec, &mut out), Some(EmitKind::Decoded(_))));
        }
        let stats = jb.stats();
        assert_eq!(stats.late, 0);
        assert_eq!(stats.overruns, 0);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn duplicate_is_dropped_silently() {
        let mut jb = buffer();
        insert(&mut jb, 200);
        insert(&mut jb, 200);
        let stats = jb.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn late_packet_is_counted_and_dropped() {
        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        for seq in 100..104 {
            insert(&mut jb, seq);
        }
        for _ in 0..4 {
            jb.emit(&mut dec, &mut out);
        }
        // next_seq is now 104; 90 is far behind the half-window.
        insert(&mut jb, 90);
        assert_eq!(jb.stats().late, 1);
        assert_eq!(jb.stats().received, 4);
    }

    #[test]
    fn overrun_drops_the_newest_packet() {
        let mut jb = buffer();
        insert(&mut jb, 100);
        insert(&mut jb, 116); // delta == slot count
        assert_eq!(jb.stats().overruns, 1);
        assert_eq!(jb.stats().received, 1);
    }

    #[test]
    fn underflow_emits_nothing() {
        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        assert!(jb.emit(&mut dec, &mut out).is_none());

        insert(&mut jb, 7);
        assert!(jb.emit(&mut dec, &mut out).is_some());
        // Drained: whole-stream underflow, not a per-slot loss.
        assert!(jb.emit(&mut dec, &mut out).is_none());
        assert_eq!(jb.stats().lost, 0);
    }

    #[test]
    fn emitted_sequences_are_strictly_increasing_under_shuffle() {
        use rand::seq::SliceRandom;

        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        let mut rng = rand::rng();

        let mut last: Option<u16> = None;
        let mut base: u16 = 300;
        for _ in 0..8 {
            let mut batch: Vec<u16> = (base..base + 8).collect();
            batch.shuffle(&mut rng);
            for seq in batch {
                insert(&mut jb, seq);
            }
            for _ in 0..8 {
                if let Some(EmitKind::Decoded(_)) = jb.emit(&mut dec, &mut out) {
                    let seq = out[0] as u16;
                    if let Some(prev) = last {
                        assert!(seq_delta(seq, prev) > 0, "{seq} emitted after {prev}");
                    }
                    last = Some(seq);
                }
            }
            base += 8;
        }
        assert_eq!(jb.stats().lost, 0);
    }

    #[test]
    fn straggler_behind_the_timeline_start_is_late() {
        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        // The first insert pins the timeline; anything older missed it.
        insert(&mut jb, 51);
        insert(&mut jb, 50);
        assert_eq!(jb.stats().late, 1);
        assert!(matches!(jb.emit(&mut dec, &mut out), Some(EmitKind::Decoded(_))));
        assert_eq!(out[0], 51);
    }

    #[test]
    fn out_of_order_arrival_within_the_window_counts_as_reorder() {
        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        insert(&mut jb, 60);
        insert(&mut jb, 62);
        insert(&mut jb, 61);
        for want in [60u16, 61, 62] {
            assert!(matches!(jb.emit(&mut dec, &mut out), Some(EmitKind::Decoded(_))));
            assert_eq!(out[0], want as i16);
        }
        let stats = jb.stats();
        assert_eq!(stats.lost, 0);
        assert!(stats.reordered >= 1);
    }

    #[test]
    fn undecodable_payload_is_concealed() {
        let mut jb = buffer();
        let mut dec = decoder();
        let mut out = [0i16; FRAME];
        jb.insert(10, 0, 1, &[0xff]); // odd length, RawPcm refuses
        assert!(matches!(jb.emit(&mut dec, &mut out), Some(EmitKind::Concealed(_))));
        assert_eq!(jb.stats().lost, 1);
    }
}
