//! Media Module - lokale Capture-Geräte
//!
//! Dieses Modul verwaltet:
//! - Mikrofon/Kamera Anforderung und Freigabe
//! - Mute/Video Toggles
//! - Bildschirmfreigabe als Ersatz für die Kamera

mod capture;
mod source;
mod track;

pub use capture::{
    CaptureBackend, CaptureHandle, DeviceGuard, HostCapture, LocalStream, MediaError,
    ScreenCapture, SAMPLE_RATE,
};
pub use source::{MediaEvent, MediaSource};
pub use track::{CallKind, LocalTrack, TrackKind, TrackSource};
