//! Abschlussbericht eines Anrufs
//!
//! Wird von `CallSession::end` zurückgegeben. Die Anrufliste persistiert
//! die einbettende Anwendung.

use super::state::{CallDirection, EndReason};
use crate::media::CallKind;
use crate::roster::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub session_id: String,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub participants: Vec<ParticipantId>,
    /// None wenn die Session nie `Connecting` erreicht hat
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    #[serde(rename = "durationMs", with = "duration_ms")]
    pub duration: Duration,
    pub reached_active: bool,
    pub end_reason: EndReason,
}

impl CallRecord {
    /// Verpasst/fehlgeschlagen: nie ein verbundener Peer
    pub fn is_missed(&self) -> bool {
        !self.reached_active
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
