//! The membership table: fixed slots, one lock, broadcasts under that lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use vs_protocol::peer::PeerRecord;

use crate::events::MembershipEvent;
use crate::member::{ConnId, Member, MemberState};
use crate::{ControlError, ControlResult};

/// Outcome of a successful JOIN: what the joiner needs for JOIN_ACK and the
/// PEER_LIST snapshot taken in the same table version as the PEER_JOIN
/// broadcast.
pub struct JoinInfo {
    pub source: u32,
    pub records: Vec<PeerRecord>,
}

pub struct Membership {
    max_peers: usize,
    /// Sequence counter for server-originated control frames.
    ctl_seq: AtomicU32,
    inner: Mutex<Inner>,
}

struct Slot {
    gen: u64,
    member: Option<Member>,
}

struct Inner {
    slots: Vec<Slot>,
    next_id: u32,
}

impl Membership {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            ctl_seq: AtomicU32::new(1),
            inner: Mutex::new(Inner {
                slots: (0..max_peers).map(|_| Slot { gen: 0, member: None }).collect(),
                next_id: 1,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_peers
    }

    pub fn next_seq(&self) -> u32 {
        self.ctl_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly accepted control connection.
    pub fn accept(&self, control_addr: SocketAddr, tx: mpsc::Sender<Bytes>) -> ControlResult<ConnId> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter()
            .position(|s| s.member.is_none())
            .ok_or(ControlError::TableFull)?;
        inner.slots[slot].gen += 1;
        inner.slots[slot].member = Some(Member::new(control_addr, tx));
        let conn = ConnId { slot, gen: inner.slots[slot].gen };
        debug!(slot, %control_addr, "control connection accepted");
        Ok(conn)
    }

    /// True while `conn` still owns its table entry (it may have been swept).
    pub fn contains(&self, conn: ConnId) -> bool {
        let inner = self.inner.lock();
        inner
            .slots
            .get(conn.slot)
            .is_some_and(|s| s.gen == conn.gen && s.member.is_some())
    }

    /// HELLO: assign an id. A proposed id of 0 (or one already in use) gets a
    /// server-allocated id. Repeating HELLO returns the id already assigned.
    pub fn identify(&self, conn: ConnId, proposed_id: u32, name: &str) -> ControlResult<u32> {
        let mut inner = self.inner.lock();
        let taken = proposed_id != 0 && inner.id_in_use(proposed_id);
        let member = inner.member_mut(conn)?;
        match member.state {
            MemberState::Accepted => {}
            MemberState::Identified => return Ok(member.id),
            _ => return Err(ControlError::InvalidState("hello while in session")),
        }
        let id = if proposed_id != 0 && !taken {
            proposed_id
        } else {
            inner.alloc_id()
        };
        let member = inner.member_mut(conn)?;
        member.id = id;
        member.source = id;
        member.name = name.to_string();
        member.state = MemberState::Identified;
        member.last_heartbeat = std::time::Instant::now();
        debug!(slot = conn.slot, id, name, "member identified");
        Ok(id)
    }

    /// JOIN: learn the media address, promote to in-session, snapshot the
    /// rest of the table for PEER_LIST and broadcast PEER_JOIN — all in one
    /// table version.
    pub fn join(&self, conn: ConnId, media_port: u16) -> ControlResult<JoinInfo> {
        let mut inner = self.inner.lock();
        let member = inner.member_mut(conn)?;
        if member.state != MemberState::Identified {
            return Err(ControlError::InvalidState("join before hello"));
        }
        member.media_addr = Some(SocketAddr::new(member.control_addr.ip(), media_port));
        member.state = MemberState::InSession;
        member.last_heartbeat = std::time::Instant::now();
        let source = member.source;
        let record = member.record();

        let records: Vec<PeerRecord> = inner
            .slots
            .iter()
            .filter_map(|s| s.member.as_ref())
            .filter(|m| m.in_session() && m.source != source)
            .map(|m| m.record())
            .collect();

        self.broadcast(&inner, Some(conn.slot), MembershipEvent::PeerJoined(record));
        debug!(slot = conn.slot, source, media_port, peers = records.len(), "member joined session");
        Ok(JoinInfo { source, records })
    }

    /// Remove a member on LEAVE, disconnect, or timeout. Broadcasts
    /// PEER_LEAVE when the member had been visible to the session. A stale
    /// handle (already swept, slot reused) is a no-op.
    pub fn remove(&self, conn: ConnId) -> Option<u32> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(conn.slot)?;
        if slot.gen != conn.gen {
            return None;
        }
        let mut member = slot.member.take()?;
        member.state = MemberState::Left;
        if member.id != 0 {
            self.broadcast(&inner, Some(conn.slot), MembershipEvent::PeerLeft(member.id));
        }
        debug!(slot = conn.slot, id = member.id, "member removed");
        Some(member.id)
    }

    /// Touch the heartbeat clock. Changes nothing else.
    pub fn heartbeat(&self, conn: ConnId) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        inner.member_mut(conn)?.last_heartbeat = std::time::Instant::now();
        Ok(())
    }

    pub fn set_muted(&self, conn: ConnId, muted: bool) -> ControlResult<()> {
        self.update_flags(conn, |m| m.muted = muted)
    }

    pub fn set_audio_active(&self, conn: ConnId, active: bool) -> ControlResult<()> {
        self.update_flags(conn, |m| m.audio_active = active)
    }

    fn update_flags(&self, conn: ConnId, f: impl FnOnce(&mut Member)) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        let member = inner.member_mut(conn)?;
        f(member);
        member.last_heartbeat = std::time::Instant::now();
        if member.in_session() {
            let ev = MembershipEvent::PeerStateChanged {
                id: member.id,
                talking: member.talking,
                muted: member.muted,
                audio_active: member.audio_active,
            };
            self.broadcast(&inner, Some(conn.slot), ev);
        }
        Ok(())
    }

    /// Media-path talking flag, keyed by source. Broadcasts only on change.
    /// Returns whether the flag changed.
    pub fn set_talking_by_source(&self, source: u32, talking: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slot_by_source(source) else {
            return false;
        };
        let Some(member) = inner.slots[slot].member.as_mut() else {
            return false;
        };
        if member.talking == talking {
            return false;
        }
        member.talking = talking;
        let ev = MembershipEvent::PeerStateChanged {
            id: member.id,
            talking,
            muted: member.muted,
            audio_active: member.audio_active,
        };
        self.broadcast(&inner, Some(slot), ev);
        true
    }

    /// Media addresses of every other in-session member. `None` when the
    /// source is unknown or not in session (a datagram racing its JOIN).
    pub fn fanout_targets(&self, source: u32) -> Option<Vec<SocketAddr>> {
        let inner = self.inner.lock();
        let sender = inner.slot_by_source(source)?;
        let targets = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != sender)
            .filter_map(|(_, s)| s.member.as_ref())
            .filter(|m| m.in_session())
            .filter_map(|m| m.media_addr)
            .collect();
        Some(targets)
    }

    /// Expire members silent for longer than `timeout`. Returns their ids.
    pub fn sweep(&self, timeout: Duration) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let expired: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.member.as_ref().map(|m| (i, m)))
            .filter(|(_, m)| m.last_heartbeat.elapsed() > timeout)
            .map(|(i, _)| i)
            .collect();

        let mut ids = Vec::with_capacity(expired.len());
        for slot in expired {
            if let Some(mut member) = inner.slots[slot].member.take() {
                member.state = MemberState::Left;
                debug!(slot, id = member.id, "heartbeat timeout");
                if member.id != 0 {
                    self.broadcast(&inner, Some(slot), MembershipEvent::PeerLeft(member.id));
                }
                ids.push(member.id);
            }
        }
        ids
    }

    /// Number of in-session members (the discovery `cur_peers` count).
    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.member.as_ref())
            .filter(|m| m.in_session())
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.member.is_some()).count()
    }

    pub fn member_id(&self, conn: ConnId) -> Option<u32> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(conn.slot)?;
        if slot.gen != conn.gen {
            return None;
        }
        slot.member.as_ref().map(|m| m.id).filter(|id| *id != 0)
    }

    /// Enqueue `event` to every in-session member except the slot named by
    /// `subject`. Runs under the table lock held by the caller; sends never
    /// block.
    fn broadcast(&self, inner: &Inner, subject: Option<usize>, event: MembershipEvent) {
        let frame: Bytes = event.to_message().to_frame(self.next_seq());
        for (i, slot) in inner.slots.iter().enumerate() {
            if Some(i) == subject {
                continue;
            }
            let Some(member) = &slot.member else { continue };
            if !member.in_session() {
                continue;
            }
            if member.tx.try_send(frame.clone()).is_err() {
                trace!(slot = i, "control writer queue full, frame dropped");
            }
        }
    }
}

impl Inner {
    fn member_mut(&mut self, conn: ConnId) -> ControlResult<&mut Member> {
        let slot = self
            .slots
            .get_mut(conn.slot)
            .ok_or(ControlError::UnknownConnection)?;
        if slot.gen != conn.gen {
            return Err(ControlError::UnknownConnection);
        }
        slot.member.as_mut().ok_or(ControlError::UnknownConnection)
    }

    fn id_in_use(&self, id: u32) -> bool {
        self.slots.iter().filter_map(|s| s.member.as_ref()).any(|m| m.id == id)
    }

    fn slot_by_source(&self, source: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.member.as_ref().is_some_and(|m| m.in_session() && m.source == source))
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.id_in_use(id) {
                return id;
            }
        }
    }
}
