//! Capture Backends - Zugriff auf Mikrofon, Kamera und Bildschirm
//!
//! `HostCapture` verwendet cpal für Cross-Platform Audio Input.
//! Kamera und Bildschirmaufnahme stellt der Host nicht bereit; dafür
//! bringt die einbettende Anwendung ein eigenes `CaptureBackend` mit.

use super::track::{CallKind, LocalTrack, TrackKind, TrackSource};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für WebRTC/Opus)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Screen share cancelled by user")]
    UserCancelled,

    #[error("Media source already released")]
    Released,

    #[error("Media source already acquired")]
    AlreadyAcquired,

    #[error("Media source not acquired")]
    NotAcquired,

    #[error("No local {0:?} track")]
    NoTrack(TrackKind),

    #[error("Screen share not active")]
    NotSharing,
}

// ============================================================================
// DEVICE HANDLES
// ============================================================================

/// Vom Backend gehaltene Geräte-Ressource
pub trait CaptureHandle: Send {
    /// Gibt das Gerät an das Betriebssystem zurück
    fn release(&mut self);
}

/// RAII-Wrapper: gibt das Gerät genau einmal frei, spätestens beim Drop
pub struct DeviceGuard {
    handle: Option<Box<dyn CaptureHandle>>,
    tracks: Vec<LocalTrack>,
}

impl DeviceGuard {
    pub fn new(handle: Box<dyn CaptureHandle>, tracks: &[LocalTrack]) -> Self {
        Self {
            handle: Some(handle),
            tracks: tracks.to_vec(),
        }
    }

    /// Explizite Freigabe
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Ergebnis einer Kamera/Mikrofon-Anfrage
pub struct LocalStream {
    pub tracks: Vec<LocalTrack>,
    pub guard: DeviceGuard,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>, handle: Box<dyn CaptureHandle>) -> Self {
        let guard = DeviceGuard::new(handle, &tracks);
        Self { tracks, guard }
    }
}

/// Ergebnis einer Bildschirmfreigabe
///
/// `ended` feuert wenn der Benutzer die Freigabe über das Betriebssystem beendet.
pub struct ScreenCapture {
    pub track: LocalTrack,
    pub guard: DeviceGuard,
    pub ended: oneshot::Receiver<()>,
}

impl ScreenCapture {
    pub fn new(
        track: LocalTrack,
        handle: Box<dyn CaptureHandle>,
        ended: oneshot::Receiver<()>,
    ) -> Self {
        let guard = DeviceGuard::new(handle, std::slice::from_ref(&track));
        Self {
            track,
            guard,
            ended,
        }
    }
}

// ============================================================================
// CAPTURE BACKEND
// ============================================================================

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Fordert Geräte für die Anrufart an (Audio: Mikrofon, Video: Mikrofon + Kamera)
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, MediaError>;

    /// Fordert einen Display-Capture Stream an
    async fn start_screen_share(&self) -> Result<ScreenCapture, MediaError>;
}

// ============================================================================
// HOST CAPTURE (cpal)
// ============================================================================

/// Capture Backend auf Basis der Standard-Audiogeräte des Hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCapture;

impl HostCapture {
    pub fn new() -> Self {
        Self
    }

    /// Namen aller verfügbaren Eingabegeräte
    pub fn input_devices() -> Result<Vec<String>, MediaError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .collect();
        Ok(devices)
    }
}

#[async_trait]
impl CaptureBackend for HostCapture {
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, MediaError> {
        if kind.wants_video() {
            return Err(MediaError::DeviceUnavailable(
                "camera capture is not available on this host".to_string(),
            ));
        }

        let track = LocalTrack::new(TrackSource::Microphone);
        let handle = MicrophoneHandle::open(&track)?;
        Ok(LocalStream::new(vec![track], Box::new(handle)))
    }

    async fn start_screen_share(&self) -> Result<ScreenCapture, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "display capture is not available on this host".to_string(),
        ))
    }
}

/// Offener Mikrofon-Stream
struct MicrophoneHandle {
    stream: Option<Stream>,
}

// Stream ist nicht automatisch Send, wird aber nur zum Droppen angefasst
unsafe impl Send for MicrophoneHandle {}

impl MicrophoneHandle {
    fn open(track: &LocalTrack) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".to_string()))?;

        let config = select_input_config(&device)?;

        tracing::info!(
            "Starting microphone capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let meter = track.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Stummgeschaltet: Gerät läuft weiter, Level bleibt bei 0
                    if !meter.is_enabled() || data.is_empty() {
                        meter.publish_level(0.0);
                        return;
                    }
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    meter.publish_level(rms);
                },
                |err| {
                    tracing::error!("Microphone capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
        })
    }
}

impl CaptureHandle for MicrophoneHandle {
    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Microphone released");
        }
    }
}

/// Wählt die beste Input-Konfiguration
///
/// Priorität: 48kHz F32 > beliebige F32 > erste verfügbare.
fn select_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
        .collect();

    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32 && supports_target(*c))
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            MediaError::DeviceUnavailable("no suitable audio configuration".to_string())
        })
}
