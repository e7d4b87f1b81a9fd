//! Session-Status, Teilnehmer und Events

use super::record::CallRecord;
use crate::media::MediaError;
use crate::peer::{LinkState, NegotiationError, RemoteTrack};
use crate::roster::{ParticipantId, ParticipantInfo, RosterError};
use crate::signaling::SignalingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInSession,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Screen share cancelled by user")]
    UserCancelled,

    #[error("Call ended before it was established")]
    Cancelled,

    #[error("No active call")]
    NoActiveCall,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Media error: {0}")]
    Media(MediaError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Roster lookup failed: {0}")]
    Roster(String),
}

impl From<MediaError> for CallError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::DeviceUnavailable(reason) => CallError::DeviceUnavailable(reason),
            MediaError::UserCancelled => CallError::UserCancelled,
            MediaError::Released => CallError::NoActiveCall,
            other => CallError::Media(other),
        }
    }
}

impl From<RosterError> for CallError {
    fn from(error: RosterError) -> Self {
        CallError::Roster(error.to_string())
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Aggregierter Status einer Call Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Noch nicht gestartet, lokale Geräte werden angefordert
    Idle,
    /// Peer Links verhandeln
    Connecting,
    /// Mindestens ein Peer Link verbunden
    Active,
    /// Terminal
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    /// Alle Remote-Teilnehmer haben aufgelegt oder die Verbindung verloren
    AllPeersLeft,
    /// Kein Peer Link konnte verhandelt werden
    NegotiationFailed,
    /// Innerhalb der Connect-Deadline wurde kein Peer Link verbunden
    ConnectTimeout,
}

// ============================================================================
// PARTICIPANT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub speaking: bool,
    pub connection: LinkState,
}

impl Participant {
    pub fn new(info: ParticipantInfo, video: bool) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            avatar_ref: info.avatar_ref,
            audio_enabled: true,
            video_enabled: video,
            speaking: false,
            connection: LinkState::New,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ParticipantChanged(Participant),
    ParticipantLeft(ParticipantId),
    LocalMediaChanged {
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    },
    RemoteTrack {
        participant: ParticipantId,
        track: RemoteTrack,
    },
    Ended(CallRecord),
}
