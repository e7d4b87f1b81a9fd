//! In-Memory Backends für Unit Tests
//!
//! Ersetzen Geräte, WebRTC und den Signaling-Server, damit Sessions
//! deterministisch getestet werden können.

use crate::media::{
    CallKind, CaptureBackend, CaptureHandle, LocalStream, LocalTrack, MediaError, ScreenCapture,
    TrackKind, TrackSource,
};
use crate::peer::{
    IceCandidate, LinkEvents, LinkState, NegotiationError, PeerConnection, PeerConnector,
};
use crate::signaling::{SignalEnvelope, SignalPayload, SignalingError, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Wartet bis `condition` erfüllt ist
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// CAPTURE
// ============================================================================

struct CountingHandle(Arc<AtomicUsize>);

impl CaptureHandle for CountingHandle {
    fn release(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCapture {
    fail_video: AtomicBool,
    cancel_screen: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
    acquires: AtomicUsize,
    releases: Arc<AtomicUsize>,
    screen_releases: Arc<AtomicUsize>,
    screen_end: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Kamera-Anfragen schlagen fehl
    pub fn fail_video(&self) {
        self.fail_video.store(true, Ordering::SeqCst);
    }

    /// Der Benutzer bricht den Bildschirmauswahl-Dialog ab
    pub fn cancel_screen_share(&self) {
        self.cancel_screen.store(true, Ordering::SeqCst);
    }

    /// Hält `acquire` an bis der zurückgegebene Notify ausgelöst wird
    pub fn hold_acquire(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub async fn wait_for_acquire(&self) {
        self.entered.notified().await;
    }

    /// Simuliert das Beenden der Freigabe über das Betriebssystem
    pub fn end_screen_share(&self) {
        if let Some(tx) = self.screen_end.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Freigaben von Mikrofon/Kamera
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn screen_release_count(&self) -> usize {
        self.screen_releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, MediaError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if kind.wants_video() && self.fail_video.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable("camera in use".to_string()));
        }

        let mut tracks = vec![LocalTrack::new(TrackSource::Microphone)];
        if kind.wants_video() {
            tracks.push(LocalTrack::new(TrackSource::Camera));
        }
        Ok(LocalStream::new(
            tracks,
            Box::new(CountingHandle(Arc::clone(&self.releases))),
        ))
    }

    async fn start_screen_share(&self) -> Result<ScreenCapture, MediaError> {
        if self.cancel_screen.load(Ordering::SeqCst) {
            return Err(MediaError::UserCancelled);
        }
        let (tx, rx) = oneshot::channel();
        *self.screen_end.lock() = Some(tx);
        Ok(ScreenCapture::new(
            LocalTrack::new(TrackSource::Screen),
            Box::new(CountingHandle(Arc::clone(&self.screen_releases))),
            rx,
        ))
    }
}

// ============================================================================
// PEER CONNECTIONS
// ============================================================================

pub struct FakeConnection {
    remote: String,
    events: LinkEvents,
    reject_offers: bool,
    /// Eigenes Offer wartet auf ein Answer (`have-local-offer`)
    local_offer: AtomicBool,
    tracks: Mutex<Vec<LocalTrack>>,
    candidates: Mutex<Vec<IceCandidate>>,
    replaced: Mutex<Vec<Option<String>>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeConnection {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Meldet einen Verbindungsstatus wie die echte Verbindung
    pub fn emit_state(&self, state: LinkState) {
        self.events.state_changed(state);
    }

    pub fn emit_audio_level(&self, level: f32) {
        self.events.audio_level(level);
    }

    pub fn added_tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn replaced_video(&self) -> Vec<Option<String>> {
        self.replaced.lock().clone()
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<&LocalTrack>,
    ) -> Result<bool, NegotiationError> {
        let has_video = self
            .tracks
            .lock()
            .iter()
            .any(|t| t.kind() == TrackKind::Video);
        if has_video {
            self.replaced
                .lock()
                .push(track.map(|t| t.id().to_string()));
        }
        Ok(has_video)
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.local_offer.store(true, Ordering::SeqCst);
        Ok(format!("offer-{}-{}", self.remote, n))
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, NegotiationError> {
        if self.reject_offers {
            return Err(NegotiationError::InvalidSdp(format!("rejected: {offer_sdp}")));
        }
        // Wie webrtc-rs: ein Remote Offer ist in have-local-offer ungültig
        if self.local_offer.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidSdp(
                "invalid proposed signaling state transition from have-local-offer applying remote offer"
                    .to_string(),
            ));
        }
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("answer-{}-{}", self.remote, n))
    }

    async fn apply_answer(&self, _answer_sdp: &str) -> Result<(), NegotiationError> {
        self.local_offer.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    reject_offers: AtomicBool,
    fail_connect: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Folgende Verbindungen lehnen jedes Remote Offer ab
    pub fn reject_offers(&self) {
        self.reject_offers.store(true, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, remote: &str) {
        self.fail_connect.lock().push(remote.to_string());
    }

    /// Hält `connect` an bis der zurückgegebene Notify ausgelöst wird
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub async fn wait_for_connect(&self) {
        self.entered.notified().await;
    }

    /// Letzte Verbindung zu `remote`
    pub fn connection(&self, remote: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.remote == remote)
            .cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.entered.notify_one();
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail_connect.lock().iter().any(|r| r == events.remote()) {
            return Err(NegotiationError::WebRtc("no route to peer".to_string()));
        }

        let connection = Arc::new(FakeConnection {
            remote: events.remote().to_string(),
            events,
            reject_offers: self.reject_offers.load(Ordering::SeqCst),
            local_offer: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalEnvelope>>,
    fail: AtomicBool,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().clone()
    }

    /// Payloads an einen Teilnehmer in Sendereihenfolge
    pub fn sent_to(&self, to: &str) -> Vec<SignalPayload> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.to == to)
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn hangups_to(&self, to: &str) -> Vec<Option<String>> {
        self.sent_to(to)
            .into_iter()
            .filter_map(|p| match p {
                SignalPayload::Hangup { reason } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignaling {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}
