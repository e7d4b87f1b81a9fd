//! Peer Link - eine verhandelte Media-Verbindung zu einem Teilnehmer
//!
//! Signaling-Nachrichten eines Links werden in Ankunftsreihenfolge
//! verarbeitet. ICE Candidates, die vor dem Setzen beider Descriptions
//! ankommen, werden gepuffert und danach in FIFO-Reihenfolge angewendet.

use super::connection::{PeerConnection, PeerConnector};
use super::state::{
    ConnectionEvent, IceCandidate, LinkEvent, LinkEvents, LinkState, NegotiationError, RemoteTrack,
};
use crate::media::{LocalTrack, TrackKind};
use crate::roster::ParticipantId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Ergebnis eines Video-Track Tauschs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSwap {
    /// Direkt am Sender ersetzt
    Replaced,
    /// Neues Offer nötig; muss an den Remote-Teilnehmer gesendet werden
    Renegotiate { offer: String },
}

struct LinkInner {
    state: LinkState,
    local_ready: bool,
    remote_ready: bool,
    pending_candidates: VecDeque<IceCandidate>,
    local_tracks: Vec<LocalTrack>,
    remote_tracks: Vec<RemoteTrack>,
    ever_connected: bool,
}

pub struct PeerLink {
    id: u64,
    remote: ParticipantId,
    connection: Arc<dyn PeerConnection>,
    events: LinkEvents,
    /// Serialisiert Offer/Answer/Candidate-Verarbeitung
    signal_lock: tokio::sync::Mutex<()>,
    inner: Mutex<LinkInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    /// Erstellt die Verbindung, hängt die lokalen Tracks an und startet
    /// den Negotiation-Timer
    pub async fn open(
        remote: ParticipantId,
        connector: &dyn PeerConnector,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        local_tracks: &[LocalTrack],
        negotiation_timeout: Duration,
    ) -> Result<Arc<Self>, NegotiationError> {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let events = LinkEvents::new(remote.clone(), id, event_tx);

        let connection = connector.connect(events.clone()).await?;
        for track in local_tracks {
            if let Err(e) = connection.add_track(track).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }

        let link = Arc::new(Self {
            id,
            remote,
            connection,
            events,
            signal_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(LinkInner {
                state: LinkState::New,
                local_ready: false,
                remote_ready: false,
                pending_candidates: VecDeque::new(),
                local_tracks: local_tracks.to_vec(),
                remote_tracks: Vec::new(),
                ever_connected: false,
            }),
            timer: Mutex::new(None),
        });

        let timer_events = link.events.clone();
        *link.timer.lock() = Some(tokio::spawn(async move {
            tokio::time::sleep(negotiation_timeout).await;
            timer_events.emit(ConnectionEvent::NegotiationTimedOut);
        }));

        tracing::debug!(remote = %link.remote, link_id = id, "Peer link opened");
        Ok(link)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn ever_connected(&self) -> bool {
        self.inner.lock().ever_connected
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.inner.lock().local_tracks.clone()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.lock().remote_tracks.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending_candidates.len()
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    /// Erstellt das initiale Offer (ausgehende Seite)
    pub async fn create_offer(&self) -> Result<String, NegotiationError> {
        let _guard = self.signal_lock.lock().await;
        self.ensure_open()?;

        let offer = self.connection.create_offer().await.map_err(|e| self.fail(e))?;
        self.inner.lock().local_ready = true;
        self.flush_candidates().await;
        Ok(offer)
    }

    /// Verarbeitet ein Remote Offer und gibt das Answer zurück
    pub async fn handle_remote_offer(&self, sdp: &str) -> Result<String, NegotiationError> {
        let _guard = self.signal_lock.lock().await;
        self.ensure_open()?;

        let answer = self
            .connection
            .create_answer(sdp)
            .await
            .map_err(|e| self.fail(e))?;
        {
            let mut inner = self.inner.lock();
            inner.local_ready = true;
            inner.remote_ready = true;
        }
        self.flush_candidates().await;
        Ok(answer)
    }

    pub async fn handle_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let _guard = self.signal_lock.lock().await;
        self.ensure_open()?;

        self.connection
            .apply_answer(sdp)
            .await
            .map_err(|e| self.fail(e))?;
        self.inner.lock().remote_ready = true;
        self.flush_candidates().await;
        Ok(())
    }

    /// Wendet einen Remote Candidate an oder puffert ihn
    ///
    /// Ein einzelner ungültiger Candidate lässt den Link nicht fehlschlagen.
    pub async fn handle_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let _guard = self.signal_lock.lock().await;
        self.ensure_open()?;

        {
            let mut inner = self.inner.lock();
            if !(inner.local_ready && inner.remote_ready) {
                inner.pending_candidates.push_back(candidate);
                tracing::debug!(
                    remote = %self.remote,
                    queued = inner.pending_candidates.len(),
                    "Queued early ICE candidate"
                );
                return Ok(());
            }
        }

        self.connection.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!(remote = %self.remote, "Failed to add ICE candidate: {}", e);
            e
        })
    }

    /// Tauscht den ausgehenden Video-Track (Bildschirmfreigabe)
    pub async fn replace_outgoing_video_track(
        &self,
        track: Option<&LocalTrack>,
    ) -> Result<TrackSwap, NegotiationError> {
        let _guard = self.signal_lock.lock().await;
        self.ensure_open()?;

        {
            let mut inner = self.inner.lock();
            inner.local_tracks.retain(|t| t.kind() != TrackKind::Video);
            if let Some(track) = track {
                inner.local_tracks.push(track.clone());
            }
        }

        if self.connection.replace_video_track(track).await? {
            tracing::debug!(remote = %self.remote, "Replaced outgoing video track");
            return Ok(TrackSwap::Replaced);
        }

        // Kein Video-Sender vorhanden: Track hinzufügen und neu verhandeln
        if let Some(track) = track {
            self.connection.add_track(track).await?;
        }
        let offer = self.connection.create_offer().await?;
        self.inner.lock().local_ready = true;
        tracing::info!(remote = %self.remote, "Renegotiating for outgoing video");
        Ok(TrackSwap::Renegotiate { offer })
    }

    // ========================================================================
    // STATE
    // ========================================================================

    /// Übernimmt einen beobachteten Status; gibt true zurück wenn er sich geändert hat
    pub fn advance(&self, next: LinkState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_advance_to(next) {
            return false;
        }
        inner.state = next;
        if next == LinkState::Connected {
            inner.ever_connected = true;
            drop(inner);
            self.stop_timer();
        }
        true
    }

    /// Markiert einen nie verbundenen Link als fehlgeschlagen
    pub fn negotiation_timed_out(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.ever_connected || inner.state.is_terminal() {
            return false;
        }
        inner.state = LinkState::Failed;
        tracing::warn!(remote = %self.remote, "Negotiation timed out");
        true
    }

    pub fn add_remote_track(&self, track: RemoteTrack) {
        let mut inner = self.inner.lock();
        if !inner.remote_tracks.iter().any(|t| t.id == track.id) {
            inner.remote_tracks.push(track);
        }
    }

    /// Schließt die Verbindung. Mehrfacher Aufruf ist ein No-op.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return;
            }
            inner.state = LinkState::Closed;
            inner.pending_candidates.clear();
        }
        self.stop_timer();

        if let Err(e) = self.connection.close().await {
            tracing::warn!(remote = %self.remote, "Error closing peer connection: {}", e);
        }
        tracing::debug!(remote = %self.remote, link_id = self.id, "Peer link closed");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        match self.inner.lock().state {
            LinkState::Closed => Err(NegotiationError::Closed),
            _ => Ok(()),
        }
    }

    async fn flush_candidates(&self) {
        let queued: Vec<IceCandidate> = {
            let mut inner = self.inner.lock();
            if !(inner.local_ready && inner.remote_ready) {
                return;
            }
            inner.pending_candidates.drain(..).collect()
        };

        if !queued.is_empty() {
            tracing::debug!(remote = %self.remote, count = queued.len(), "Applying queued ICE candidates");
        }
        for candidate in queued {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                tracing::warn!(remote = %self.remote, "Failed to add queued ICE candidate: {}", e);
            }
        }
    }

    /// Negotiation-Fehler bleiben im Link und werden als Statuswechsel gemeldet
    fn fail(&self, error: NegotiationError) -> NegotiationError {
        tracing::warn!(remote = %self.remote, "Negotiation failed: {}", error);
        self.events.state_changed(LinkState::Failed);
        error
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::testing::{candidate, FakeConnector};

    async fn open_link(
        connector: &FakeConnector,
        tracks: &[LocalTrack],
    ) -> (Arc<PeerLink>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = PeerLink::open(
            "bob".to_string(),
            connector,
            tx,
            tracks,
            Duration::from_secs(20),
        )
        .await
        .unwrap();
        (link, rx)
    }

    #[tokio::test]
    async fn test_early_candidates_applied_in_order() {
        let connector = FakeConnector::new();
        let (link, _rx) = open_link(&connector, &[]).await;
        let connection = connector.connection("bob").unwrap();

        for n in 1..=3 {
            link.handle_remote_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(link.pending_candidates(), 3);
        assert!(connection.candidates().is_empty());

        link.handle_remote_offer("remote-offer").await.unwrap();

        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(
            connection.candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        // Danach direkt angewendet
        link.handle_remote_candidate(candidate(4)).await.unwrap();
        assert_eq!(connection.candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_offerer_waits_for_answer() {
        let connector = FakeConnector::new();
        let (link, _rx) = open_link(&connector, &[]).await;
        let connection = connector.connection("bob").unwrap();

        link.create_offer().await.unwrap();
        link.handle_remote_candidate(candidate(1)).await.unwrap();
        assert_eq!(link.pending_candidates(), 1);

        link.handle_remote_answer("remote-answer").await.unwrap();
        assert_eq!(connection.candidates(), vec![candidate(1)]);
    }

    #[tokio::test]
    async fn test_negotiation_failure_reported_as_state() {
        let connector = FakeConnector::new();
        connector.reject_offers();
        let (link, mut rx) = open_link(&connector, &[]).await;

        let result = link.handle_remote_offer("garbage").await;
        assert!(matches!(result, Err(NegotiationError::InvalidSdp(_))));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, ConnectionEvent::StateChanged(LinkState::Failed));
        assert_eq!(event.link_id, link.id());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = FakeConnector::new();
        let (link, _rx) = open_link(&connector, &[]).await;
        let connection = connector.connection("bob").unwrap();

        link.close().await;
        link.close().await;

        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(connection.close_count(), 1);
        assert!(!link.advance(LinkState::Connected));
        assert_eq!(
            link.handle_remote_answer("late").await,
            Err(NegotiationError::Closed)
        );
    }

    #[tokio::test]
    async fn test_replace_falls_back_to_renegotiation() {
        let connector = FakeConnector::new();
        let mic = LocalTrack::new(TrackSource::Microphone);
        let (link, _rx) = open_link(&connector, &[mic.clone()]).await;
        let connection = connector.connection("bob").unwrap();

        let screen = LocalTrack::new(TrackSource::Screen);
        let swap = link.replace_outgoing_video_track(Some(&screen)).await.unwrap();

        assert!(matches!(swap, TrackSwap::Renegotiate { .. }));
        assert_eq!(connection.added_tracks(), vec![mic.clone(), screen.clone()]);
        assert_eq!(link.local_tracks(), vec![mic, screen]);
    }

    #[tokio::test]
    async fn test_replace_without_renegotiation() {
        let connector = FakeConnector::new();
        let mic = LocalTrack::new(TrackSource::Microphone);
        let camera = LocalTrack::new(TrackSource::Camera);
        let (link, _rx) = open_link(&connector, &[mic, camera.clone()]).await;
        let connection = connector.connection("bob").unwrap();

        let screen = LocalTrack::new(TrackSource::Screen);
        assert_eq!(
            link.replace_outgoing_video_track(Some(&screen)).await.unwrap(),
            TrackSwap::Replaced
        );
        assert_eq!(
            link.replace_outgoing_video_track(Some(&camera)).await.unwrap(),
            TrackSwap::Replaced
        );
        assert_eq!(
            connection.replaced_video(),
            vec![Some(screen.id().to_string()), Some(camera.id().to_string())]
        );
        assert_eq!(connection.offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_fires() {
        let connector = FakeConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = PeerLink::open("bob".into(), &*connector, tx, &[], Duration::from_secs(5))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, ConnectionEvent::NegotiationTimedOut);
        assert!(link.negotiation_timed_out());
        assert_eq!(link.state(), LinkState::Failed);
        assert!(!link.negotiation_timed_out());
    }

    #[tokio::test]
    async fn test_connected_link_ignores_timeout() {
        let connector = FakeConnector::new();
        let (link, _rx) = open_link(&connector, &[]).await;

        assert!(link.advance(LinkState::Checking));
        assert!(link.advance(LinkState::Connected));
        assert!(!link.advance(LinkState::Checking));
        assert!(!link.negotiation_timed_out());
        assert!(link.ever_connected());
    }
}
