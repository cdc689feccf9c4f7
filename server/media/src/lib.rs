//! Server-side media relay.
//!
//! Responsibilities:
//! - Parse and validate incoming media datagrams.
//! - Identify the source against the membership table and update its
//!   talking flag from the voice-activity bit.
//! - Forward the unchanged datagram to every other in-session member.
//!
//! The relay never decodes audio and never mixes; it is a pure fan-out.
//! Backpressure policy: sends are non-blocking, a would-block is a dropped
//! datagram, one failing recipient does not affect the others.

pub mod relay;

pub use relay::{DatagramOut, MediaRelay, MemberDirectory, NoopMetrics, RelayConfig, RelayMetrics};
