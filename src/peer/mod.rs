//! Peer Module - Verbindungen zu einzelnen Remote-Teilnehmern
//!
//! Dieses Modul verwaltet:
//! - Offer/Answer Austausch und ICE Candidate Pufferung
//! - Austausch des ausgehenden Video-Tracks
//! - Beobachtung des Verbindungsstatus als Events

mod connection;
mod link;
mod rtc;
mod state;

pub use connection::{PeerConnection, PeerConnector};
pub use link::{PeerLink, TrackSwap};
pub use rtc::{RtcConnection, RtcConnector};
pub use state::{
    ConnectionEvent, IceCandidate, LinkEvent, LinkEvents, LinkState, NegotiationError, RemoteTrack,
};
