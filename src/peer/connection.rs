//! Abstraktion der zugrunde liegenden Peer Connection

use super::state::{IceCandidate, LinkEvents, NegotiationError};
use crate::media::LocalTrack;
use async_trait::async_trait;
use std::sync::Arc;

/// Eine einzelne Media-Verbindung zu einem Remote-Teilnehmer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Tauscht den ausgehenden Video-Track ohne Neuverhandlung
    ///
    /// `Ok(false)` bedeutet, dass kein Video-Sender existiert und neu
    /// verhandelt werden muss.
    async fn replace_video_track(&self, track: Option<&LocalTrack>)
        -> Result<bool, NegotiationError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Setzt das Remote Offer und gibt das gesetzte Answer zurück
    async fn create_answer(&self, offer_sdp: &str) -> Result<String, NegotiationError>;

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Erstellt Verbindungen; die Verbindung meldet Beobachtungen über `events`
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: LinkEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
