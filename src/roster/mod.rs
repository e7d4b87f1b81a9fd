//! Roster Module - Teilnehmer eines Raums
//!
//! Liefert Anzeigenamen und Avatare für die Teilnehmer eines Chats/Raums.
//! Wird nur zur Beschriftung verwendet, nie für die Verhandlung.

mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::SqliteRoster;

pub type ParticipantId = String;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Roster lookup failed: {0}")]
    Lookup(String),
}

// ============================================================================
// PARTICIPANT INFO
// ============================================================================

/// Identität eines Teilnehmers für die UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Externe Roster-Quelle: Raum-ID → Teilnehmer
#[async_trait]
pub trait RosterLookup: Send + Sync {
    async fn members(&self, room_id: &str) -> Result<Vec<ParticipantInfo>, RosterError>;
}
