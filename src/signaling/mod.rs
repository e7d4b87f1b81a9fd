//! Signaling Module - Austausch von Offer/Answer/Candidates
//!
//! - `SignalingTransport`: ausgehende Seite, von der Session verwendet
//! - `SignalingClient`: WebSocket-Transport mit signierten Frames
//! - `SignalEnvelope`: Wire-Format zwischen zwei Sessions

mod client;
mod messages;
mod transport;

pub use client::{SignalingClient, SignalingEvent};
pub use messages::{
    ClientFrame, ServerFrame, SignalEnvelope, SignalPayload, HANGUP_BUSY, HANGUP_DECLINED,
};
pub use transport::{SignalingError, SignalingTransport};
