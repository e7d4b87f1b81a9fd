//! Media Source
//!
//! Besitzt die lokalen Capture-Geräte einer Call Session:
//! - Genau eine Anforderung pro Session, genau eine Freigabe
//! - Enabled-Toggle ohne das Gerät zu stoppen
//! - Bildschirmfreigabe als Ersatz für den Kamera-Track

use super::capture::{CaptureBackend, DeviceGuard, MediaError};
use super::track::{CallKind, LocalTrack, TrackKind};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    TrackToggled { kind: TrackKind, enabled: bool },
    /// Die Freigabe wurde außerhalb der App beendet (z.B. über die OS-Leiste)
    ScreenShareEnded { track_id: String },
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquiring,
    Live,
    Released,
}

struct ScreenShare {
    track: LocalTrack,
    guard: DeviceGuard,
    watcher: JoinHandle<()>,
}

struct SourceInner {
    phase: Phase,
    tracks: Vec<LocalTrack>,
    guard: Option<DeviceGuard>,
    screen: Option<ScreenShare>,
    screen_pending: bool,
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    inner: Mutex<SourceInner>,
    event_tx: broadcast::Sender<MediaEvent>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>, event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));

        Self {
            backend,
            inner: Mutex::new(SourceInner {
                phase: Phase::Idle,
                tracks: Vec::new(),
                guard: None,
                screen: None,
                screen_pending: false,
            }),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_tx.subscribe()
    }

    /// Fordert die lokalen Geräte an
    ///
    /// Wurde die Quelle während der Anfrage freigegeben, wird das Ergebnis
    /// sofort wieder zurückgegeben und `Released` gemeldet.
    pub async fn acquire(&self, kind: CallKind) -> Result<Vec<LocalTrack>, MediaError> {
        {
            let mut inner = self.inner.lock();
            match inner.phase {
                Phase::Idle => inner.phase = Phase::Acquiring,
                Phase::Acquiring | Phase::Live => return Err(MediaError::AlreadyAcquired),
                Phase::Released => return Err(MediaError::Released),
            }
        }

        let result = self.backend.acquire(kind).await;

        let mut inner = self.inner.lock();
        match result {
            Err(e) => {
                if inner.phase == Phase::Acquiring {
                    inner.phase = Phase::Idle;
                }
                tracing::warn!("Failed to acquire {:?} capture: {}", kind, e);
                Err(e)
            }
            Ok(stream) => {
                if inner.phase == Phase::Released {
                    drop(inner);
                    tracing::info!("Capture finished after release, returning devices");
                    stream.guard.release();
                    return Err(MediaError::Released);
                }

                inner.phase = Phase::Live;
                inner.tracks = stream.tracks.clone();
                inner.guard = Some(stream.guard);
                tracing::info!("Acquired {} local track(s) for {:?} call", stream.tracks.len(), kind);
                Ok(stream.tracks)
            }
        }
    }

    /// Stoppt alle Tracks und gibt die Geräte frei. Mehrfacher Aufruf ist ein No-op.
    pub fn release(&self) {
        let (guard, screen) = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Released {
                return;
            }
            inner.phase = Phase::Released;
            (inner.guard.take(), inner.screen.take())
        };

        if let Some(screen) = screen {
            screen.watcher.abort();
            screen.guard.release();
        }
        if let Some(guard) = guard {
            guard.release();
        }

        tracing::info!("Media source released");
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().phase == Phase::Released
    }

    /// Schaltet den Track um ohne das Gerät zu stoppen; gibt den neuen Status zurück
    pub fn toggle_track(&self, kind: TrackKind) -> Result<bool, MediaError> {
        let enabled = {
            let inner = self.inner.lock();
            Self::ensure_live(inner.phase)?;
            let track = inner
                .tracks
                .iter()
                .find(|t| t.kind() == kind)
                .ok_or(MediaError::NoTrack(kind))?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            enabled
        };

        tracing::debug!("Local {:?} track enabled: {}", kind, enabled);
        let _ = self.event_tx.send(MediaEvent::TrackToggled { kind, enabled });
        Ok(enabled)
    }

    /// Enabled-Status des Tracks; false wenn es keinen gibt
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.inner
            .lock()
            .tracks
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.is_enabled() && t.is_live())
            .unwrap_or(false)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Audio)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Video)
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.inner.lock().tracks.clone()
    }

    /// Input-Level des Mikrofons (0.0 - 1.0)
    pub fn audio_level(&self) -> f32 {
        self.inner
            .lock()
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .map(|t| t.level())
            .unwrap_or(0.0)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.lock().screen.is_some()
    }

    /// Der aktuell ausgehende Video-Track: Bildschirm falls aktiv, sonst Kamera
    pub fn outgoing_video(&self) -> Option<LocalTrack> {
        let inner = self.inner.lock();
        match &inner.screen {
            Some(screen) => Some(screen.track.clone()),
            None => inner
                .tracks
                .iter()
                .find(|t| t.kind() == TrackKind::Video)
                .cloned(),
        }
    }

    /// Startet die Bildschirmfreigabe
    ///
    /// Der Aufrufer muss den Track an alle Peer Links verteilen.
    pub async fn start_screen_share(&self) -> Result<LocalTrack, MediaError> {
        {
            let mut inner = self.inner.lock();
            Self::ensure_live(inner.phase)?;
            if let Some(screen) = &inner.screen {
                return Ok(screen.track.clone());
            }
            if inner.screen_pending {
                return Err(MediaError::AlreadyAcquired);
            }
            inner.screen_pending = true;
        }

        let result = self.backend.start_screen_share().await;

        let mut inner = self.inner.lock();
        inner.screen_pending = false;
        let capture = match result {
            Ok(capture) => capture,
            Err(e) => {
                tracing::info!("Screen share not started: {}", e);
                return Err(e);
            }
        };

        if inner.phase == Phase::Released {
            drop(inner);
            capture.guard.release();
            return Err(MediaError::Released);
        }

        let track = capture.track.clone();
        let watcher = Self::watch_screen_end(
            capture.ended,
            track.id().to_string(),
            self.event_tx.clone(),
        );
        inner.screen = Some(ScreenShare {
            track: capture.track,
            guard: capture.guard,
            watcher,
        });

        tracing::info!(track_id = %track.id(), "Screen share started");
        Ok(track)
    }

    /// Beendet die Bildschirmfreigabe; gibt den Kamera-Track zur Wiederherstellung zurück
    pub fn stop_screen_share(&self) -> Result<Option<LocalTrack>, MediaError> {
        self.take_screen(None)
    }

    /// Wie `stop_screen_share`, aber nur für den angegebenen Screen-Track
    ///
    /// Stop und externes Ende können sich überschneiden; nur der erste Aufruf
    /// liefert `Ok`.
    pub fn finish_screen_share(&self, track_id: &str) -> Result<Option<LocalTrack>, MediaError> {
        self.take_screen(Some(track_id))
    }

    fn take_screen(&self, track_id: Option<&str>) -> Result<Option<LocalTrack>, MediaError> {
        let mut inner = self.inner.lock();
        let screen = match inner.screen.take() {
            Some(screen) if track_id.map_or(true, |id| screen.track.id() == id) => screen,
            other => {
                inner.screen = other;
                return Err(MediaError::NotSharing);
            }
        };
        let camera = inner
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned();
        drop(inner);

        screen.watcher.abort();
        screen.guard.release();
        tracing::info!(track_id = %screen.track.id(), "Screen share stopped");
        Ok(camera)
    }

    fn watch_screen_end(
        ended: oneshot::Receiver<()>,
        track_id: String,
        event_tx: broadcast::Sender<MediaEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Ein gedroppter Sender zählt ebenfalls als Ende
            let _ = ended.await;
            tracing::info!(track_id = %track_id, "Screen share ended externally");
            let _ = event_tx.send(MediaEvent::ScreenShareEnded { track_id });
        })
    }

    fn ensure_live(phase: Phase) -> Result<(), MediaError> {
        match phase {
            Phase::Live => Ok(()),
            Phase::Released => Err(MediaError::Released),
            Phase::Idle | Phase::Acquiring => Err(MediaError::NotAcquired),
        }
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MediaSource")
            .field("phase", &inner.phase)
            .field("tracks", &inner.tracks)
            .field("screen_sharing", &inner.screen.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapture;
    use std::time::Duration;

    fn source(capture: &Arc<FakeCapture>) -> MediaSource {
        MediaSource::new(capture.clone(), 16)
    }

    #[tokio::test]
    async fn test_toggle_mute_parity() {
        let capture = FakeCapture::new();
        let media = source(&capture);
        media.acquire(CallKind::Audio).await.unwrap();

        // Enabled-Flag entspricht der Parität der Anzahl Aufrufe
        for n in 1..=7 {
            let enabled = media.toggle_track(TrackKind::Audio).unwrap();
            assert_eq!(enabled, n % 2 == 0);
            assert_eq!(media.is_enabled(TrackKind::Audio), n % 2 == 0);
        }
        // Gerät läuft weiter
        assert_eq!(capture.release_count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let capture = FakeCapture::new();
        let media = source(&capture);
        let tracks = media.acquire(CallKind::Video).await.unwrap();
        assert_eq!(tracks.len(), 2);

        media.release();
        media.release();

        assert_eq!(capture.release_count(), 1);
        assert!(tracks.iter().all(|t| !t.is_live()));
        assert_eq!(media.toggle_track(TrackKind::Audio), Err(MediaError::Released));
    }

    #[tokio::test]
    async fn test_acquire_only_once() {
        let capture = FakeCapture::new();
        let media = source(&capture);
        media.acquire(CallKind::Audio).await.unwrap();
        assert_eq!(
            media.acquire(CallKind::Audio).await,
            Err(MediaError::AlreadyAcquired)
        );
        assert_eq!(capture.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_device_unavailable_leaves_nothing_behind() {
        let capture = FakeCapture::new();
        capture.fail_video();
        let media = source(&capture);

        let result = media.acquire(CallKind::Video).await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
        assert!(media.tracks().is_empty());
        assert_eq!(capture.release_count(), 0);
    }

    #[tokio::test]
    async fn test_release_during_acquire_returns_devices() {
        let capture = FakeCapture::new();
        let gate = capture.hold_acquire();
        let media = Arc::new(source(&capture));

        let pending = {
            let media = Arc::clone(&media);
            tokio::spawn(async move { media.acquire(CallKind::Video).await })
        };
        capture.wait_for_acquire().await;

        media.release();
        gate.notify_one();

        let result = pending.await.unwrap();
        assert_eq!(result, Err(MediaError::Released));
        assert_eq!(capture.release_count(), 1);
    }

    #[tokio::test]
    async fn test_screen_share_swap_and_restore() {
        let capture = FakeCapture::new();
        let media = source(&capture);
        let tracks = media.acquire(CallKind::Video).await.unwrap();
        let camera = tracks.iter().find(|t| t.kind() == TrackKind::Video).cloned();

        let screen = media.start_screen_share().await.unwrap();
        assert!(media.is_screen_sharing());
        assert_eq!(media.outgoing_video(), Some(screen.clone()));

        let restored = media.stop_screen_share().unwrap();
        assert_eq!(restored, camera);
        assert!(!screen.is_live());
        assert_eq!(media.stop_screen_share(), Err(MediaError::NotSharing));
    }

    #[tokio::test]
    async fn test_screen_share_cancelled() {
        let capture = FakeCapture::new();
        capture.cancel_screen_share();
        let media = source(&capture);
        media.acquire(CallKind::Video).await.unwrap();

        assert_eq!(media.start_screen_share().await, Err(MediaError::UserCancelled));
        assert!(!media.is_screen_sharing());
        assert!(media.is_enabled(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_external_end_is_surfaced() {
        let capture = FakeCapture::new();
        let media = source(&capture);
        media.acquire(CallKind::Video).await.unwrap();
        let mut events = media.subscribe();

        let screen = media.start_screen_share().await.unwrap();
        capture.end_screen_share();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MediaEvent::ScreenShareEnded {
                track_id: screen.id().to_string()
            }
        );

        // Nur der erste Abschluss zählt
        assert!(media.finish_screen_share(screen.id()).is_ok());
        assert_eq!(
            media.finish_screen_share(screen.id()),
            Err(MediaError::NotSharing)
        );
    }
}
