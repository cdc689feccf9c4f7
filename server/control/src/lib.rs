//! Server-side session state: the membership table and the per-peer
//! protocol state machine.
//!
//! All membership mutation is serialized under one lock; broadcasts enqueue
//! to each member's control writer while that lock is held, so a snapshot
//! and the broadcast it pairs with always see the same table version.

pub mod events;
pub mod member;
pub mod membership;
pub mod session;

pub use member::{ConnId, Member, MemberState};
pub use membership::Membership;
pub use session::SessionHandler;

use thiserror::Error;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("session table full")]
    TableFull,

    #[error("unknown connection")]
    UnknownConnection,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Protocol(#[from] vs_protocol::ProtocolError),
}
