//! Verbindungsstatus, ICE Candidates und Events eines Peer Links

use crate::media::TrackKind;
use crate::roster::ParticipantId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer link closed")]
    Closed,
}

// ============================================================================
// LINK STATE
// ============================================================================

/// Status einer Peer-Verbindung
///
/// Übergänge laufen nur vorwärts. Ein terminaler Link wird nicht
/// wiederverwendet, sondern neu erstellt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    fn rank(self) -> u8 {
        match self {
            LinkState::New => 0,
            LinkState::Checking => 1,
            LinkState::Connected => 2,
            LinkState::Disconnected => 3,
            LinkState::Failed => 4,
            LinkState::Closed => 5,
        }
    }

    /// Disconnected zählt als terminal, es gibt keine Wiederverbindung
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }

    pub fn can_advance_to(self, next: LinkState) -> bool {
        next.rank() > self.rank()
    }

    /// Übersetzt den webrtc-rs Status; `Unspecified` hat keine Entsprechung
    pub fn from_rtc(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Checking),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        }
    }
}

// ============================================================================
// ICE CANDIDATE
// ============================================================================

/// ICE Candidate im Browser-JSON Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Eingehender Track eines Remote-Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Beobachtung an der zugrunde liegenden Verbindung
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(LinkState),
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    /// Audio-Level des Remote-Teilnehmers (0.0 - 1.0)
    AudioLevel(f32),
    NegotiationTimedOut,
}

/// Event mit Absender-Link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub remote: ParticipantId,
    pub link_id: u64,
    pub event: ConnectionEvent,
}

/// Observer-Handle, das eine Verbindung an ihre Session meldet
#[derive(Debug, Clone)]
pub struct LinkEvents {
    remote: ParticipantId,
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(remote: ParticipantId, link_id: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            remote,
            link_id,
            tx,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Events nach dem Ende der Session werden verworfen
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(LinkEvent {
            remote: self.remote.clone(),
            link_id: self.link_id,
            event,
        });
    }

    pub fn state_changed(&self, state: LinkState) {
        self.emit(ConnectionEvent::StateChanged(state));
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(ConnectionEvent::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(ConnectionEvent::RemoteTrack(track));
    }

    pub fn audio_level(&self, level: f32) {
        self.emit(ConnectionEvent::AudioLevel(level));
    }
}
