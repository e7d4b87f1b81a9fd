//! Message Types für das Signaling
//!
//! `SignalEnvelope` ist der Vertrag zwischen zwei Call Sessions und wird
//! vom Server unverändert weitergereicht. `ClientFrame`/`ServerFrame` sind
//! die Rahmen der WebSocket-Verbindung zum Server.

use crate::media::CallKind;
use crate::peer::IceCandidate;
use crate::roster::ParticipantId;
use serde::{Deserialize, Serialize};

/// Hangup-Grund: der Angerufene ist bereits in einem Anruf
pub const HANGUP_BUSY: &str = "busy";
/// Hangup-Grund: der Angerufene hat abgelehnt
pub const HANGUP_DECLINED: &str = "declined";

// ============================================================================
// SESSION SIGNALING
// ============================================================================

/// Adressierte Signaling-Nachricht zwischen zwei Teilnehmern einer Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub session_id: String,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: to.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
        kind: CallKind,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    /// Mute/Video-Status des Absenders für die Anzeige beim Empfänger
    MediaState {
        #[serde(rename = "audioEnabled")]
        audio_enabled: bool,
        #[serde(rename = "videoEnabled")]
        video_enabled: bool,
    },
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice_candidate",
            SignalPayload::MediaState { .. } => "media_state",
            SignalPayload::Hangup { .. } => "hangup",
        }
    }
}

// ============================================================================
// CLIENT → SERVER FRAMES
// ============================================================================

/// Unsignierter Client-Frame; Timestamp und Signatur fügt der Client hinzu
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    Signal {
        envelope: SignalEnvelope,
    },
    Heartbeat {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },
}

// ============================================================================
// SERVER → CLIENT FRAMES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
        #[serde(default)]
        timestamp: i64,
    },

    Signal {
        envelope: SignalEnvelope,
        #[serde(default)]
        timestamp: i64,
    },

    Error {
        code: i32,
        message: String,
        #[serde(default)]
        timestamp: i64,
    },

    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = SignalEnvelope::new(
            "chat-42",
            "alice",
            "bob",
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
                kind: CallKind::Video,
            },
        );

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "sessionId": "chat-42",
                "from": "alice",
                "to": "bob",
                "payload": { "type": "offer", "sdp": "v=0", "kind": "video" }
            })
        );
    }

    #[test]
    fn test_payload_variants_parse() {
        let candidate: SignalPayload = serde_json::from_value(json!({
            "type": "ice_candidate",
            "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0" }
        }))
        .unwrap();
        assert_eq!(candidate.name(), "ice_candidate");

        let state: SignalPayload = serde_json::from_value(json!({
            "type": "media_state", "audioEnabled": false, "videoEnabled": true
        }))
        .unwrap();
        assert_eq!(
            state,
            SignalPayload::MediaState {
                audio_enabled: false,
                video_enabled: true
            }
        );

        let hangup: SignalPayload = serde_json::from_value(json!({ "type": "hangup" })).unwrap();
        assert_eq!(hangup, SignalPayload::Hangup { reason: None });
    }

    #[test]
    fn test_server_frame_without_timestamp() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"registered","participantId":"alice"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Registered { participant_id, .. } if participant_id == "alice"));
    }
}
