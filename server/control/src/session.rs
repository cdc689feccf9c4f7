//! Per-peer protocol driver: decodes one control frame and produces the
//! replies the protocol requires, mutating the membership table on the way.
//!
//! The handler is shared by every connection task; all state lives in the
//! [`Membership`] table.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use vs_protocol::control::{
    ControlHeader, ControlMessage, Heartbeat, HelloAck, JoinAck, TimeSync,
};
use vs_protocol::{wall_ms, SAMPLE_RATE};

use crate::member::ConnId;
use crate::{ControlError, ControlResult, Membership};

/// What one frame produced: frames to write back on this connection, and
/// whether the connection should now close.
#[derive(Default)]
pub struct HandlerOutput {
    pub replies: Vec<Bytes>,
    pub disconnect: bool,
}

pub struct SessionHandler {
    membership: Arc<Membership>,
    /// Advertised in HELLO_ACK so the client knows where to send media.
    media_port: u16,
}

impl SessionHandler {
    pub fn new(membership: Arc<Membership>, media_port: u16) -> Self {
        Self { membership, media_port }
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn handle_frame(
        &self,
        conn: ConnId,
        header: &ControlHeader,
        payload: &[u8],
    ) -> ControlResult<HandlerOutput> {
        let msg = match ControlMessage::decode(header.msg_type, payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(slot = conn.slot(), msg_type = header.msg_type, "undecodable control frame: {e}");
                return Ok(HandlerOutput::default());
            }
        };

        let mut out = HandlerOutput::default();
        match msg {
            ControlMessage::Hello(hello) => {
                let ack = match self.membership.identify(conn, hello.proposed_id, &hello.name) {
                    Ok(id) => HelloAck {
                        result: 0,
                        assigned_id: id,
                        media_port: self.media_port,
                        server_time_ms: wall_ms(),
                    },
                    Err(ControlError::InvalidState(reason)) => {
                        debug!(slot = conn.slot(), reason, "hello rejected");
                        HelloAck { result: 1, assigned_id: 0, media_port: 0, server_time_ms: wall_ms() }
                    }
                    Err(e) => return Err(e),
                };
                self.reply(&mut out, ControlMessage::HelloAck(ack));
            }
            ControlMessage::Join(join) => match self.membership.join(conn, join.media_port) {
                Ok(info) => {
                    self.reply(
                        &mut out,
                        ControlMessage::JoinAck(JoinAck {
                            result: 0,
                            source: info.source,
                            base_timestamp: base_timestamp(),
                        }),
                    );
                    self.reply(&mut out, ControlMessage::PeerList(info.records));
                }
                Err(ControlError::InvalidState(reason)) => {
                    debug!(slot = conn.slot(), reason, "join rejected");
                    self.reply(
                        &mut out,
                        ControlMessage::JoinAck(JoinAck { result: 1, source: 0, base_timestamp: 0 }),
                    );
                }
                Err(e) => return Err(e),
            },
            ControlMessage::Leave => {
                // Removal (and the PEER_LEAVE broadcast) is the connection
                // task's job; it runs exactly once on every exit path.
                out.disconnect = true;
            }
            ControlMessage::Heartbeat(_) => {
                self.membership.heartbeat(conn)?;
                self.reply(&mut out, ControlMessage::Heartbeat(Heartbeat { time_ms: wall_ms() }));
            }
            ControlMessage::TimeSync(ts) => {
                self.reply(
                    &mut out,
                    ControlMessage::TimeSync(TimeSync {
                        client_time_ms: ts.client_time_ms,
                        server_time_ms: wall_ms(),
                    }),
                );
            }
            ControlMessage::AudioStart => self.membership.set_audio_active(conn, true)?,
            ControlMessage::AudioStop => self.membership.set_audio_active(conn, false)?,
            ControlMessage::AudioMute => self.membership.set_muted(conn, true)?,
            ControlMessage::AudioUnmute => self.membership.set_muted(conn, false)?,
            other => {
                // Server-to-client or discovery traffic has no business here.
                debug!(slot = conn.slot(), ?other, "unexpected message on control channel");
            }
        }
        Ok(out)
    }

    fn reply(&self, out: &mut HandlerOutput, msg: ControlMessage) {
        out.replies.push(msg.to_frame(self.membership.next_seq()));
    }
}

/// The joiner's RTP epoch: wall clock scaled to the sample clock, truncated.
fn base_timestamp() -> u32 {
    (wall_ms() as u64 * (SAMPLE_RATE as u64 / 1000)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use vs_protocol::control::FrameAccumulator;

    fn handler() -> SessionHandler {
        SessionHandler::new(Arc::new(Membership::new(8)), 6000)
    }

    fn feed(h: &SessionHandler, conn: ConnId, msg: ControlMessage) -> HandlerOutput {
        let frame = msg.to_frame(1);
        let mut acc = FrameAccumulator::new();
        acc.extend(&frame);
        let (header, body) = acc.next_frame().unwrap().unwrap();
        h.handle_frame(conn, &header, &body).unwrap()
    }

    fn decode_reply(out: &HandlerOutput, i: usize) -> ControlMessage {
        let mut acc = FrameAccumulator::new();
        acc.extend(&out.replies[i]);
        let (header, body) = acc.next_frame().unwrap().unwrap();
        ControlMessage::decode(header.msg_type, &body).unwrap()
    }

    fn accept(h: &SessionHandler) -> ConnId {
        let (tx, rx) = mpsc::channel(16);
        std::mem::forget(rx); // keep the writer queue open for the test
        h.membership().accept("10.0.0.1:9999".parse().unwrap(), tx).unwrap()
    }

    #[test]
    fn hello_then_join_yields_ack_and_peer_list() {
        let h = handler();
        let conn = accept(&h);

        let out = feed(&h, conn, ControlMessage::Hello(vs_protocol::control::Hello {
            proposed_id: 0,
            name: "alice".into(),
        }));
        let id = match decode_reply(&out, 0) {
            ControlMessage::HelloAck(ack) => {
                assert_eq!(ack.result, 0);
                assert_eq!(ack.media_port, 6000);
                assert_ne!(ack.assigned_id, 0);
                ack.assigned_id
            }
            other => panic!("expected HelloAck, got {other:?}"),
        };

        let out = feed(&h, conn, ControlMessage::Join(vs_protocol::control::Join {
            media_port: 50_000,
        }));
        assert_eq!(out.replies.len(), 2);
        match decode_reply(&out, 0) {
            ControlMessage::JoinAck(ack) => {
                assert_eq!(ack.result, 0);
                assert_eq!(ack.source, id);
            }
            other => panic!("expected JoinAck, got {other:?}"),
        }
        match decode_reply(&out, 1) {
            ControlMessage::PeerList(records) => assert!(records.is_empty()),
            other => panic!("expected PeerList, got {other:?}"),
        }
    }

    #[test]
    fn join_before_hello_is_rejected_without_state_change() {
        let h = handler();
        let conn = accept(&h);
        let out = feed(&h, conn, ControlMessage::Join(vs_protocol::control::Join {
            media_port: 50_000,
        }));
        match decode_reply(&out, 0) {
            ControlMessage::JoinAck(ack) => assert_eq!(ack.result, 1),
            other => panic!("expected JoinAck, got {other:?}"),
        }
        assert_eq!(h.membership().session_count(), 0);
    }

    #[test]
    fn heartbeat_is_echoed_with_server_time() {
        let h = handler();
        let conn = accept(&h);
        feed(&h, conn, ControlMessage::Hello(vs_protocol::control::Hello {
            proposed_id: 0,
            name: "a".into(),
        }));
        let out = feed(&h, conn, ControlMessage::Heartbeat(Heartbeat { time_ms: 5 }));
        assert!(matches!(decode_reply(&out, 0), ControlMessage::Heartbeat(_)));
        assert!(!out.disconnect);
    }

    #[test]
    fn leave_requests_disconnect() {
        let h = handler();
        let conn = accept(&h);
        feed(&h, conn, ControlMessage::Hello(vs_protocol::control::Hello {
            proposed_id: 0,
            name: "a".into(),
        }));
        let out = feed(&h, conn, ControlMessage::Leave);
        assert!(out.disconnect);
        assert!(out.replies.is_empty());
        // The slot itself is reclaimed by the connection task's removal.
        assert_eq!(h.membership().connection_count(), 1);
        h.membership().remove(conn);
        assert_eq!(h.membership().connection_count(), 0);
    }

    #[test]
    fn undecodable_frame_is_dropped_not_fatal() {
        let h = handler();
        let conn = accept(&h);
        let header = {
            let frame = ControlMessage::AudioMute.to_frame(1);
            let mut acc = FrameAccumulator::new();
            acc.extend(&frame);
            acc.next_frame().unwrap().unwrap().0
        };
        // Heartbeat payload is 4 bytes; hand it an empty one.
        let mut bad = header;
        bad.msg_type = vs_protocol::control::MsgType::Heartbeat as u16;
        let out = h.handle_frame(conn, &bad, &[]).unwrap();
        assert!(out.replies.is_empty());
        assert!(!out.disconnect);
    }
}
