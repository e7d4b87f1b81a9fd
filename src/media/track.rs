//! Lokale Tracks
//!
//! Ein `LocalTrack` ist ein leichtgewichtiges Handle auf eine Capture-Quelle.
//! Klone teilen sich Enabled-, Live- und Level-Status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        matches!(self, CallKind::Video)
    }
}

/// Art eines einzelnen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Herkunft eines lokalen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    /// f32-Bits des letzten Input-Levels (0.0 - 1.0)
    level: Arc<AtomicU32>,
}

impl LocalTrack {
    pub fn new(source: TrackSource) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), source)
    }

    pub fn with_id(id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
            level: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// false sobald das Gerät freigegeben wurde
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.publish_level(0.0);
    }

    /// Aktuelles Input-Level, von der Capture-Quelle gemeldet
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Wird vom Capture-Callback aufgerufen
    pub fn publish_level(&self, level: f32) {
        self.level
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}
