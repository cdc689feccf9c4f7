use std::net::SocketAddr;

use bytes::Bytes;
use tracing::trace;

use vs_protocol::rtp::{self, MAX_MEDIA_DATAGRAM, MEDIA_HEADER_LEN};

/// Membership lookups the relay needs. Implemented by the control plane's
/// membership table.
pub trait MemberDirectory: Send + Sync {
    /// Media addresses of every other in-session member, or `None` when the
    /// source is unknown (a datagram may legitimately predate its JOIN).
    fn fanout_targets(&self, source: u32) -> Option<Vec<SocketAddr>>;

    /// Update the source's talking flag from the datagram's VAD bit.
    fn set_talking(&self, source: u32, talking: bool);
}

/// One non-blocking datagram send. A would-block is an error; the relay
/// counts it and moves on.
pub trait DatagramOut: Send + Sync {
    fn send_to(&self, target: SocketAddr, datagram: &Bytes) -> std::io::Result<()>;
}

/// Accounting hooks, one per drop reason.
pub trait RelayMetrics: Send + Sync {
    fn inc_rx(&self, _bytes: usize) {}
    fn inc_drop_invalid(&self) {}
    fn inc_drop_oversize(&self) {}
    fn inc_drop_unknown_source(&self) {}
    fn inc_send_error(&self) {}
    fn inc_forwarded(&self, _fanout: usize) {}
}

pub struct NoopMetrics;
impl RelayMetrics for NoopMetrics {}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Largest datagram accepted (header + payload).
    pub max_datagram_bytes: usize,
    /// Smallest (the header).
    pub min_datagram_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_datagram_bytes: MAX_MEDIA_DATAGRAM,
            min_datagram_bytes: MEDIA_HEADER_LEN,
        }
    }
}

pub struct MediaRelay<D, O, M> {
    cfg: RelayConfig,
    directory: D,
    out: O,
    metrics: M,
}

impl<D: MemberDirectory, O: DatagramOut, M: RelayMetrics> MediaRelay<D, O, M> {
    pub fn new(cfg: RelayConfig, directory: D, out: O, metrics: M) -> Self {
        Self { cfg, directory, out, metrics }
    }

    /// Handle one received datagram: validate, identify, fan out unchanged.
    /// Returns the number of recipients the datagram was sent to.
    pub fn handle_datagram(&self, from: SocketAddr, datagram: Bytes) -> usize {
        self.metrics.inc_rx(datagram.len());

        if datagram.len() < self.cfg.min_datagram_bytes {
            self.metrics.inc_drop_invalid();
            return 0;
        }
        if datagram.len() > self.cfg.max_datagram_bytes {
            self.metrics.inc_drop_oversize();
            return 0;
        }
        let header = match rtp::decode_datagram(&datagram) {
            Ok((header, _)) => header,
            Err(e) => {
                trace!(%from, "invalid media datagram: {e}");
                self.metrics.inc_drop_invalid();
                return 0;
            }
        };

        let Some(targets) = self.directory.fanout_targets(header.source) else {
            // Unknown source: may predate a join race. Drop silently.
            self.metrics.inc_drop_unknown_source();
            return 0;
        };

        self.directory.set_talking(header.source, header.has_voice());

        let mut sent = 0;
        for target in targets {
            match self.out.send_to(target, &datagram) {
                Ok(()) => sent += 1,
                Err(e) => {
                    trace!(%target, "media send failed: {e}");
                    self.metrics.inc_send_error();
                }
            }
        }
        if sent > 0 {
            self.metrics.inc_forwarded(sent);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vs_protocol::rtp::{encode_datagram, MediaHeader, FLAG_VOICE, PT_VOICE};

    struct FixedDirectory {
        source: u32,
        targets: Vec<SocketAddr>,
        talking_updates: Mutex<Vec<(u32, bool)>>,
    }

    impl MemberDirectory for FixedDirectory {
        fn fanout_targets(&self, source: u32) -> Option<Vec<SocketAddr>> {
            (source == self.source).then(|| self.targets.clone())
        }
        fn set_talking(&self, source: u32, talking: bool) {
            self.talking_updates.lock().push((source, talking));
        }
    }

    #[derive(Default)]
    struct RecordingOut {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        fail_for: Option<SocketAddr>,
    }

    impl DatagramOut for RecordingOut {
        fn send_to(&self, target: SocketAddr, datagram: &Bytes) -> std::io::Result<()> {
            if self.fail_for == Some(target) {
                return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
            }
            self.sent.lock().push((target, datagram.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counters {
        unknown: AtomicUsize,
        oversize: AtomicUsize,
        send_errors: AtomicUsize,
    }

    impl RelayMetrics for &Counters {
        fn inc_drop_unknown_source(&self) {
            self.unknown.fetch_add(1, Ordering::Relaxed);
        }
        fn inc_drop_oversize(&self) {
            self.oversize.fetch_add(1, Ordering::Relaxed);
        }
        fn inc_send_error(&self) {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:6000").parse().unwrap()
    }

    fn datagram(source: u32, payload: &[u8]) -> Bytes {
        let header = MediaHeader {
            payload_type: PT_VOICE,
            seq: 1,
            timestamp: 960,
            source,
            payload_len: payload.len() as u16,
            flags: FLAG_VOICE,
        };
        encode_datagram(&header, payload)
    }

    #[test]
    fn fans_out_identical_bytes_to_everyone_but_the_sender() {
        let relay = MediaRelay::new(
            RelayConfig::default(),
            FixedDirectory {
                source: 7,
                targets: vec![addr(2), addr(3)],
                talking_updates: Mutex::new(vec![]),
            },
            RecordingOut::default(),
            NoopMetrics,
        );

        let d = datagram(7, b"opus-bytes");
        let sent = relay.handle_datagram(addr(1), d.clone());
        assert_eq!(sent, 2);

        let sent_log = relay.out.sent.lock();
        assert_eq!(sent_log.len(), 2);
        for (target, bytes) in sent_log.iter() {
            assert_ne!(*target, addr(1));
            assert_eq!(bytes.as_slice(), d.as_ref());
        }
        assert_eq!(relay.directory.talking_updates.lock().as_slice(), &[(7, true)]);
    }

    #[test]
    fn unknown_source_is_dropped_silently() {
        let counters = Counters::default();
        let relay = MediaRelay::new(
            RelayConfig::default(),
            FixedDirectory { source: 7, targets: vec![addr(2)], talking_updates: Mutex::new(vec![]) },
            RecordingOut::default(),
            &counters,
        );
        assert_eq!(relay.handle_datagram(addr(1), datagram(99, b"x")), 0);
        assert_eq!(counters.unknown.load(Ordering::Relaxed), 1);
        assert!(relay.directory.talking_updates.lock().is_empty());
    }

    #[test]
    fn oversize_datagram_is_dropped() {
        let counters = Counters::default();
        let relay = MediaRelay::new(
            RelayConfig::default(),
            FixedDirectory { source: 7, targets: vec![addr(2)], talking_updates: Mutex::new(vec![]) },
            RecordingOut::default(),
            &counters,
        );
        let huge = Bytes::from(vec![2u8; MAX_MEDIA_DATAGRAM + 1]);
        assert_eq!(relay.handle_datagram(addr(1), huge), 0);
        assert_eq!(counters.oversize.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn one_failing_recipient_does_not_stop_the_rest() {
        let counters = Counters::default();
        let relay = MediaRelay::new(
            RelayConfig::default(),
            FixedDirectory {
                source: 7,
                targets: vec![addr(2), addr(3), addr(4)],
                talking_updates: Mutex::new(vec![]),
            },
            RecordingOut { fail_for: Some(addr(3)), ..Default::default() },
            &counters,
        );
        let sent = relay.handle_datagram(addr(1), datagram(7, b"x"));
        assert_eq!(sent, 2);
        assert_eq!(counters.send_errors.load(Ordering::Relaxed), 1);
    }
}
