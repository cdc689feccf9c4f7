//! Receive-side audio pipeline and the capture gate.
//!
//! Pipeline (playout path):
//!   network datagram → per-source jitter buffer → decode/PLC → mix → sink
//!
//! Pipeline (capture path):
//!   source frame → gate (RMS/ZCR) → encode → RTP datagram

pub mod codec;
pub mod engine;
pub mod gate;
pub mod jitter;
pub mod mixer;
