//! SQLite Roster
//!
//! Lokaler Cache der Teilnehmer und Raum-Mitgliedschaften.

use super::{ParticipantInfo, RosterError, RosterLookup};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult};
use std::path::{Path, PathBuf};

/// SQLite-Datenbank für Teilnehmer (Thread-safe durch Mutex)
pub struct SqliteRoster {
    conn: Mutex<Connection>,
}

impl SqliteRoster {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening roster database at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// Öffnet die Datenbank im Datenverzeichnis der Plattform
    pub fn open_default() -> Result<Self, RosterError> {
        Self::open(Self::default_path()?)
    }

    pub fn open_in_memory() -> Result<Self, RosterError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RosterError> {
        let roster = Self {
            conn: Mutex::new(conn),
        };
        roster.init_schema()?;
        Ok(roster)
    }

    fn default_path() -> Result<PathBuf, RosterError> {
        let proj_dirs = directories::ProjectDirs::from("org", "call-core", "call-core")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join("roster.db"))
    }

    fn init_schema(&self) -> Result<(), RosterError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_ref TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL,
                participant_id TEXT NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
                joined_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (room_id, participant_id)
            );

            CREATE INDEX IF NOT EXISTS idx_room_members_room ON room_members(room_id);
            "#,
        )?;
        Ok(())
    }

    /// Fügt einen Teilnehmer hinzu oder aktualisiert ihn
    pub fn upsert_participant(&self, info: &ParticipantInfo) -> Result<(), RosterError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO participants (id, display_name, avatar_ref)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_ref = COALESCE(excluded.avatar_ref, avatar_ref),
                updated_at = datetime('now')
            "#,
            params![info.id, info.display_name, info.avatar_ref],
        )?;
        Ok(())
    }

    pub fn participant(&self, id: &str) -> Result<ParticipantInfo, RosterError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, display_name, avatar_ref FROM participants WHERE id = ?1",
            params![id],
            |row| {
                Ok(ParticipantInfo {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_ref: row.get(2)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                RosterError::ParticipantNotFound(id.to_string())
            }
            other => RosterError::Sqlite(other),
        })
    }

    /// Trägt einen bekannten Teilnehmer in einen Raum ein
    pub fn add_member(&self, room_id: &str, participant_id: &str) -> Result<(), RosterError> {
        // Erst prüfen, damit der Fehler den Teilnehmer nennt
        self.participant(participant_id)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO room_members (room_id, participant_id)
            VALUES (?1, ?2)
            "#,
            params![room_id, participant_id],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, room_id: &str, participant_id: &str) -> Result<(), RosterError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND participant_id = ?2",
            params![room_id, participant_id],
        )?;
        Ok(())
    }

    /// Mitglieder eines Raums in Beitrittsreihenfolge
    pub fn room_members(&self, room_id: &str) -> Result<Vec<ParticipantInfo>, RosterError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.display_name, p.avatar_ref
            FROM room_members m
            JOIN participants p ON p.id = m.participant_id
            WHERE m.room_id = ?1
            ORDER BY m.rowid ASC
            "#,
        )?;

        let members = stmt
            .query_map(params![room_id], |row| {
                Ok(ParticipantInfo {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_ref: row.get(2)?,
                })
            })?
            .collect::<SqliteResult<Vec<ParticipantInfo>>>()?;

        Ok(members)
    }
}

#[async_trait]
impl RosterLookup for SqliteRoster {
    async fn members(&self, room_id: &str) -> Result<Vec<ParticipantInfo>, RosterError> {
        self.room_members(room_id)
    }
}

impl std::fmt::Debug for SqliteRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRoster").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteRoster {
        let roster = SqliteRoster::open_in_memory().unwrap();
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            roster
                .upsert_participant(&ParticipantInfo::new(id, name))
                .unwrap();
        }
        roster
    }

    #[tokio::test]
    async fn test_members_in_join_order() {
        let roster = seeded();
        roster.add_member("room-1", "carol").unwrap();
        roster.add_member("room-1", "alice").unwrap();
        roster.add_member("room-1", "alice").unwrap();
        roster.add_member("room-2", "bob").unwrap();

        let members = roster.members("room-1").await.unwrap();
        let ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["carol", "alice"]);

        roster.remove_member("room-1", "carol").unwrap();
        assert_eq!(roster.members("room-1").await.unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_keeps_avatar() {
        let roster = seeded();
        roster
            .upsert_participant(&ParticipantInfo::new("bob", "Bob").with_avatar("avatars/bob.png"))
            .unwrap();
        roster
            .upsert_participant(&ParticipantInfo::new("bob", "Bobby"))
            .unwrap();

        let bob = roster.participant("bob").unwrap();
        assert_eq!(bob.display_name, "Bobby");
        assert_eq!(bob.avatar_ref.as_deref(), Some("avatars/bob.png"));
    }

    #[test]
    fn test_unknown_participant() {
        let roster = seeded();
        assert!(matches!(
            roster.add_member("room-1", "mallory"),
            Err(RosterError::ParticipantNotFound(_))
        ));
        assert!(matches!(
            roster.participant("mallory"),
            Err(RosterError::ParticipantNotFound(_))
        ));
    }
}
