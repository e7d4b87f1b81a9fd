//! Call Session
//!
//! Besitzt die Media Source und alle Peer Links eines Anrufs und leitet
//! aus den Link-Zuständen den Session-Status ab:
//!
//! ```text
//! Idle ──start──▶ Connecting ──erster Link verbunden──▶ Active
//!   │                 │                                   │
//!   └──────end────────┴──alle Links terminal / Deadline───┴──▶ Ended
//! ```
//!
//! Link-Events, die Connect-Deadline und das Ende einer Bildschirmfreigabe
//! werden von genau einem Event-Pump Task pro Session verarbeitet.

use super::record::CallRecord;
use super::state::{CallDirection, CallError, EndReason, Participant, SessionEvent, SessionState};
use crate::config::CallConfig;
use crate::media::{CallKind, CaptureBackend, LocalTrack, MediaError, MediaEvent, MediaSource, TrackKind};
use crate::peer::{
    ConnectionEvent, LinkEvent, LinkState, PeerConnector, PeerLink, TrackSwap,
};
use crate::roster::{ParticipantId, ParticipantInfo};
use crate::signaling::{SignalEnvelope, SignalPayload, SignalingTransport};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Gemeinsame Abhängigkeiten aller Sessions eines Managers
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub local: ParticipantInfo,
    pub config: CallConfig,
    pub capture: Arc<dyn CaptureBackend>,
    pub connector: Arc<dyn PeerConnector>,
    pub signaling: Arc<dyn SignalingTransport>,
}

enum Control {
    ConnectDeadline,
    Shutdown,
}

/// Wohin ein eingehendes Signal geht
enum Route {
    Link(Arc<PeerLink>),
    Buffered,
    Join,
    Leave,
    Drop,
}

struct SessionInner {
    state: SessionState,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ended: Option<Instant>,
    participants: Vec<Participant>,
    links: HashMap<ParticipantId, Arc<PeerLink>>,
    /// Signale für Teilnehmer, deren Link noch nicht bereit ist
    pending: HashMap<ParticipantId, Vec<SignalPayload>>,
    reached_active: bool,
    record: Option<CallRecord>,
    deadline: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    fn has_participant(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Connecting | SessionState::Active)
    }

    fn duration(&self) -> Duration {
        match (self.started, self.ended) {
            (Some(started), Some(ended)) => ended.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Prüft nach einem Link-Statuswechsel ob die Session wechseln muss
    fn evaluate(&mut self) -> Option<Transition> {
        let any_connected = self
            .participants
            .iter()
            .any(|p| p.connection == LinkState::Connected);

        match self.state {
            SessionState::Connecting if any_connected => {
                self.state = SessionState::Active;
                self.reached_active = true;
                Some(Transition::Activated)
            }
            SessionState::Connecting => {
                if self.participants.is_empty()
                    || !self.participants.iter().all(|p| p.connection.is_terminal())
                {
                    return None;
                }
                let all_left = self
                    .participants
                    .iter()
                    .all(|p| p.connection == LinkState::Closed);
                Some(Transition::End(if all_left {
                    EndReason::AllPeersLeft
                } else {
                    EndReason::NegotiationFailed
                }))
            }
            SessionState::Active if !any_connected => Some(Transition::End(EndReason::AllPeersLeft)),
            _ => None,
        }
    }
}

enum Transition {
    Activated,
    End(EndReason),
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    id: String,
    kind: CallKind,
    direction: CallDirection,
    /// Anrufer bei eingehenden Sessions
    caller: Option<ParticipantId>,
    local: ParticipantInfo,
    config: CallConfig,
    media: MediaSource,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingTransport>,
    inner: Mutex<SessionInner>,
    event_tx: broadcast::Sender<SessionEvent>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl CallSession {
    /// Erstellt eine Session im Status `Idle` und startet ihren Event-Pump
    pub(crate) fn new(
        id: String,
        kind: CallKind,
        direction: CallDirection,
        caller: Option<ParticipantId>,
        deps: SessionDeps,
    ) -> Arc<Self> {
        let capacity = deps.config.event_capacity.max(1);
        let (event_tx, _) = broadcast::channel(capacity);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let media = MediaSource::new(deps.capture, capacity);
        let media_rx = media.subscribe();

        let session = Arc::new(Self {
            id,
            kind,
            direction,
            caller,
            local: deps.local,
            config: deps.config,
            media,
            connector: deps.connector,
            signaling: deps.signaling,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                started: None,
                started_at: None,
                ended: None,
                participants: Vec::new(),
                links: HashMap::new(),
                pending: HashMap::new(),
                reached_active: false,
                record: None,
                deadline: None,
            }),
            event_tx,
            link_tx,
            control_tx,
        });

        tokio::spawn(run_event_pump(
            Arc::downgrade(&session),
            link_rx,
            control_rx,
            media_rx,
        ));
        session
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    /// Zeit seit Beginn von `Connecting`, bei jedem Aufruf neu berechnet
    pub fn duration(&self) -> Duration {
        self.inner.lock().duration()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.lock().participants.clone()
    }

    pub fn participant(&self, id: &str) -> Option<Participant> {
        self.inner.lock().participants.iter().find(|p| p.id == id).cloned()
    }

    /// Anzahl offener Peer Links
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    pub fn link(&self, participant: &str) -> Option<Arc<PeerLink>> {
        self.inner.lock().links.get(participant).cloned()
    }

    pub fn is_muted(&self) -> bool {
        !self.media.is_audio_enabled()
    }

    pub fn is_video_enabled(&self) -> bool {
        self.media.is_video_enabled()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.media.is_screen_sharing()
    }

    /// Mikrofon-Level für die eigene Sprechanzeige
    pub fn local_audio_level(&self) -> f32 {
        self.media.audio_level()
    }

    /// Abschlussbericht, sobald die Session beendet ist
    pub fn record(&self) -> Option<CallRecord> {
        self.inner.lock().record.clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Fordert die Geräte an, wechselt nach `Connecting` und öffnet die Peer Links
    ///
    /// Schlägt die Anforderung fehl, bleibt die Session in `Idle`. Endet die
    /// Session noch bevor alle Links offen sind, liefert sie `Cancelled`.
    pub(crate) async fn begin(&self, roster: Vec<ParticipantInfo>) -> Result<(), CallError> {
        if let Err(e) = self.media.acquire(self.kind).await {
            return Err(match e {
                MediaError::Released => CallError::Cancelled,
                other => other.into(),
            });
        }

        let remotes: Vec<ParticipantId> = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                // end() während der Anforderung; die Geräte sind bereits freigegeben
                return Err(CallError::Cancelled);
            }

            inner.state = SessionState::Connecting;
            inner.started = Some(Instant::now());
            inner.started_at = Some(Utc::now());

            let video = self.kind.wants_video();
            for info in roster {
                if info.id == self.local.id || inner.has_participant(&info.id) {
                    continue;
                }
                inner.pending.entry(info.id.clone()).or_default();
                inner.participants.push(Participant::new(info, video));
            }

            // Vorab gepufferte Absender außerhalb des Rosters: ein Offer macht
            // sie zu Teilnehmern, alles andere wird verworfen
            let strangers: Vec<ParticipantId> = inner
                .pending
                .keys()
                .filter(|id| !inner.has_participant(id))
                .cloned()
                .collect();
            for id in strangers {
                let offered = inner
                    .pending
                    .get(&id)
                    .is_some_and(|b| matches!(b.first(), Some(SignalPayload::Offer { .. })));
                if offered && id != self.local.id {
                    tracing::info!(session_id = %self.id, remote = %id, "Participant joined via offer");
                    inner
                        .participants
                        .push(Participant::new(ParticipantInfo::new(id.as_str(), id.as_str()), video));
                } else if let Some(dropped) = inner.pending.remove(&id) {
                    tracing::debug!(
                        session_id = %self.id,
                        remote = %id,
                        "Dropped {} buffered signals from non-participant",
                        dropped.len()
                    );
                }
            }

            let control_tx = self.control_tx.clone();
            let timeout = self.config.connect_timeout();
            inner.deadline = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = control_tx.send(Control::ConnectDeadline);
            }));

            inner.participants.iter().map(|p| p.id.clone()).collect()
        };

        tracing::info!(
            session_id = %self.id,
            participants = remotes.len(),
            "Call session connecting ({:?}, {:?})",
            self.kind,
            self.direction
        );
        self.emit(SessionEvent::StateChanged(SessionState::Connecting));
        self.emit_local_media();

        join_all(remotes.into_iter().map(|remote| self.connect_participant(remote))).await;

        // end() während die Links geöffnet wurden
        if self.is_ended() {
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    /// Beendet die Session aus jedem Status; mehrfacher Aufruf liefert denselben Bericht
    pub async fn end(&self) -> CallRecord {
        self.teardown(EndReason::LocalHangup).await
    }

    /// Verwirft eine nie gestartete Session ohne Statuswechsel
    pub(crate) fn abandon(&self) {
        self.media.release();
        let _ = self.control_tx.send(Control::Shutdown);
    }

    async fn teardown(&self, reason: EndReason) -> CallRecord {
        let (record, links, notify) = {
            let mut inner = self.inner.lock();
            if let Some(record) = &inner.record {
                return record.clone();
            }

            inner.state = SessionState::Ended;
            inner.ended = Some(Instant::now());
            if let Some(deadline) = inner.deadline.take() {
                deadline.abort();
            }

            let record = CallRecord {
                session_id: self.id.clone(),
                kind: self.kind,
                direction: self.direction,
                participants: inner.participants.iter().map(|p| p.id.clone()).collect(),
                started_at: inner.started_at,
                ended_at: Utc::now(),
                duration: inner.duration(),
                reached_active: inner.reached_active,
                end_reason: reason,
            };
            inner.record = Some(record.clone());

            // Bei eigenem Auflegen werden alle noch erreichbaren Teilnehmer benachrichtigt
            let notify: Vec<ParticipantId> = if reason == EndReason::LocalHangup {
                inner
                    .participants
                    .iter()
                    .filter(|p| p.connection != LinkState::Closed)
                    .map(|p| p.id.clone())
                    .collect()
            } else {
                Vec::new()
            };

            for participant in inner.participants.iter_mut() {
                participant.connection = LinkState::Closed;
            }
            inner.pending.clear();
            let links: Vec<Arc<PeerLink>> = inner.links.drain().map(|(_, link)| link).collect();
            (record, links, notify)
        };

        tracing::info!(
            session_id = %self.id,
            reason = ?reason,
            duration_ms = record.duration.as_millis() as u64,
            "Call session ended"
        );

        self.media.release();
        for remote in notify {
            self.send_signal(&remote, SignalPayload::Hangup { reason: None })
                .await;
        }
        join_all(links.iter().map(|link| link.close())).await;
        let _ = self.control_tx.send(Control::Shutdown);

        self.emit(SessionEvent::StateChanged(SessionState::Ended));
        self.emit(SessionEvent::Ended(record.clone()));
        record
    }

    // ========================================================================
    // PARTICIPANTS
    // ========================================================================

    /// Fügt einen Teilnehmer während des Anrufs hinzu und öffnet seinen Link
    pub async fn add_participant(&self, info: ParticipantInfo) -> Result<(), CallError> {
        let remote = {
            let mut inner = self.inner.lock();
            if !inner.is_live() {
                return Err(CallError::NoActiveCall);
            }
            if info.id == self.local.id || inner.has_participant(&info.id) {
                return Ok(());
            }
            inner.pending.entry(info.id.clone()).or_default();
            let remote = info.id.clone();
            inner
                .participants
                .push(Participant::new(info, self.kind.wants_video()));
            remote
        };

        tracing::info!(session_id = %self.id, remote = %remote, "Participant joined");
        self.connect_participant(remote).await;
        Ok(())
    }

    /// Entfernt einen Teilnehmer (Auflegen oder Verlassen des Raums)
    ///
    /// Der Teilnehmer bleibt mit Status `Closed` in der Liste.
    pub async fn remove_participant(&self, id: &str) {
        let link = {
            let mut inner = self.inner.lock();
            if !inner.has_participant(id) || !inner.is_live() {
                return;
            }
            inner.pending.remove(id);
            inner.links.remove(id)
        };

        tracing::info!(session_id = %self.id, remote = %id, "Participant left");
        if let Some(link) = link {
            link.close().await;
        }
        self.emit(SessionEvent::ParticipantLeft(id.to_string()));
        self.on_link_state(id, LinkState::Closed).await;
    }

    /// Öffnet den Link zu einem Teilnehmer und spielt gepufferte Signale ab
    async fn connect_participant(&self, remote: ParticipantId) {
        let tracks = self.outgoing_tracks();
        let link = match PeerLink::open(
            remote.clone(),
            self.connector.as_ref(),
            self.link_tx.clone(),
            &tracks,
            self.config.negotiation_timeout(),
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(session_id = %self.id, remote = %remote, "Failed to open peer link: {}", e);
                self.inner.lock().pending.remove(&remote);
                self.on_link_state(&remote, LinkState::Failed).await;
                return;
            }
        };

        let registered = {
            let mut inner = self.inner.lock();
            // Hat der Teilnehmer bereits angeboten, wird nur geantwortet
            let remote_offered = inner
                .pending
                .get(&remote)
                .map(|buffer| matches!(buffer.first(), Some(SignalPayload::Offer { .. })));
            match remote_offered {
                Some(offered) if inner.is_live() && inner.has_participant(&remote) => {
                    inner.links.insert(remote.clone(), Arc::clone(&link));
                    Some(offered)
                }
                _ => None,
            }
        };
        let Some(remote_offered) = registered else {
            link.close().await;
            return;
        };

        if !remote_offered && self.should_offer(&remote) {
            if let Ok(sdp) = link.create_offer().await {
                self.send_signal(
                    &remote,
                    SignalPayload::Offer {
                        sdp,
                        kind: self.kind,
                    },
                )
                .await;
            }
        }

        // Gepufferte Signale in Ankunftsreihenfolge abspielen; erst danach
        // gehen neue Signale direkt an den Link
        loop {
            let batch = {
                let mut inner = self.inner.lock();
                match inner.pending.get_mut(&remote) {
                    Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
                    Some(_) => {
                        inner.pending.remove(&remote);
                        break;
                    }
                    None => break,
                }
            };
            for payload in batch {
                self.apply_signal(&link, &remote, payload).await;
            }
        }
    }

    /// Ausgehende Seite: immer. Eingehende Seite: nicht zum Anrufer, sonst
    /// bietet die kleinere ID an.
    fn should_offer(&self, remote: &str) -> bool {
        match self.direction {
            CallDirection::Outgoing => true,
            CallDirection::Incoming => {
                self.caller.as_deref() != Some(remote) && self.local.id.as_str() < remote
            }
        }
    }

    fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let mut tracks: Vec<LocalTrack> = self
            .media
            .tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .collect();
        tracks.extend(self.media.outgoing_video());
        tracks
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    /// Verarbeitet ein eingehendes Signal eines Teilnehmers
    pub async fn handle_signal(&self, from: &str, payload: SignalPayload) {
        let route = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Ended => Route::Drop,
                SessionState::Idle => {
                    inner.pending.entry(from.to_string()).or_default().push(payload.clone());
                    Route::Buffered
                }
                SessionState::Connecting | SessionState::Active => {
                    let known = inner.has_participant(from);
                    if known && matches!(payload, SignalPayload::Hangup { .. }) {
                        Route::Leave
                    } else if let Some(buffer) = inner.pending.get_mut(from) {
                        buffer.push(payload.clone());
                        Route::Buffered
                    } else if let Some(link) = inner.links.get(from) {
                        Route::Link(Arc::clone(link))
                    } else if !known && matches!(payload, SignalPayload::Offer { .. }) {
                        inner.pending.insert(from.to_string(), vec![payload.clone()]);
                        inner.participants.push(Participant::new(
                            ParticipantInfo::new(from, from),
                            self.kind.wants_video(),
                        ));
                        Route::Join
                    } else {
                        Route::Drop
                    }
                }
            }
        };

        match route {
            Route::Link(link) => self.apply_signal(&link, from, payload).await,
            Route::Leave => self.remove_participant(from).await,
            Route::Join => {
                tracing::info!(session_id = %self.id, remote = %from, "Participant joined via offer");
                self.connect_participant(from.to_string()).await;
            }
            Route::Buffered => {
                tracing::debug!(session_id = %self.id, remote = %from, "Buffered {} signal", payload.name());
            }
            Route::Drop => {
                tracing::debug!(session_id = %self.id, remote = %from, "Dropped {} signal", payload.name());
            }
        }
    }

    /// Puffert ein Signal ohne es zu verarbeiten (vor `begin`)
    pub(crate) fn buffer_signal(&self, from: &str, payload: SignalPayload) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Idle {
            inner.pending.entry(from.to_string()).or_default().push(payload);
        }
    }

    async fn apply_signal(&self, link: &PeerLink, from: &str, payload: SignalPayload) {
        match payload {
            SignalPayload::Offer { sdp, .. } => {
                if let Ok(answer) = link.handle_remote_offer(&sdp).await {
                    self.send_signal(from, SignalPayload::Answer { sdp: answer })
                        .await;
                }
            }
            SignalPayload::Answer { sdp } => {
                let _ = link.handle_remote_answer(&sdp).await;
            }
            SignalPayload::IceCandidate { candidate } => {
                let _ = link.handle_remote_candidate(candidate).await;
            }
            SignalPayload::MediaState {
                audio_enabled,
                video_enabled,
            } => {
                let changed = {
                    let mut inner = self.inner.lock();
                    inner.participant_mut(from).map(|p| {
                        p.audio_enabled = audio_enabled;
                        p.video_enabled = video_enabled;
                        if !audio_enabled {
                            p.speaking = false;
                        }
                        p.clone()
                    })
                };
                if let Some(participant) = changed {
                    self.emit(SessionEvent::ParticipantChanged(participant));
                }
            }
            SignalPayload::Hangup { .. } => self.remove_participant(from).await,
        }
    }

    /// Sendet ein Signal; Fehler werden nur protokolliert
    async fn send_signal(&self, to: &str, payload: SignalPayload) {
        let name = payload.name();
        let envelope = SignalEnvelope::new(self.id.clone(), self.local.id.clone(), to, payload);
        if let Err(e) = self.signaling.send(envelope).await {
            tracing::warn!(session_id = %self.id, remote = %to, "Failed to send {} signal: {}", name, e);
        }
    }

    async fn broadcast_media_state(&self) {
        let remotes: Vec<ParticipantId> = self.inner.lock().links.keys().cloned().collect();
        let audio_enabled = self.media.is_audio_enabled();
        let video_enabled = self.media.is_video_enabled() || self.media.is_screen_sharing();

        join_all(remotes.iter().map(|remote| {
            self.send_signal(
                remote,
                SignalPayload::MediaState {
                    audio_enabled,
                    video_enabled,
                },
            )
        }))
        .await;
    }

    // ========================================================================
    // LOCAL MEDIA
    // ========================================================================

    /// Schaltet das Mikrofon um; gibt den neuen Enabled-Status zurück
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let enabled = self.media.toggle_track(TrackKind::Audio)?;
        self.emit_local_media();
        self.broadcast_media_state().await;
        Ok(enabled)
    }

    /// Schaltet die Kamera um; gibt den neuen Enabled-Status zurück
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let enabled = self.media.toggle_track(TrackKind::Video)?;
        self.emit_local_media();
        self.broadcast_media_state().await;
        Ok(enabled)
    }

    /// Startet die Bildschirmfreigabe und tauscht den Video-Track auf allen Links
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        if !self.inner.lock().is_live() {
            return Err(CallError::NoActiveCall);
        }
        if self.media.is_screen_sharing() {
            return Ok(());
        }

        let track = self.media.start_screen_share().await?;
        self.swap_outgoing_video(Some(&track)).await;
        self.emit_local_media();
        self.broadcast_media_state().await;
        Ok(())
    }

    /// Beendet die Bildschirmfreigabe und stellt die Kamera wieder her
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let camera = self.media.stop_screen_share()?;
        self.swap_outgoing_video(camera.as_ref()).await;
        self.emit_local_media();
        self.broadcast_media_state().await;
        Ok(())
    }

    async fn on_screen_share_ended(&self, track_id: &str) {
        // Wurde bereits über stop_screen_share beendet
        let Ok(camera) = self.media.finish_screen_share(track_id) else {
            return;
        };
        tracing::info!(session_id = %self.id, "Screen share ended externally, restoring camera");
        self.swap_outgoing_video(camera.as_ref()).await;
        self.emit_local_media();
        self.broadcast_media_state().await;
    }

    async fn swap_outgoing_video(&self, track: Option<&LocalTrack>) {
        let links: Vec<(ParticipantId, Arc<PeerLink>)> = self
            .inner
            .lock()
            .links
            .iter()
            .map(|(id, link)| (id.clone(), Arc::clone(link)))
            .collect();

        join_all(links.iter().map(|(remote, link)| async move {
            match link.replace_outgoing_video_track(track).await {
                Ok(TrackSwap::Replaced) => {}
                Ok(TrackSwap::Renegotiate { offer }) => {
                    self.send_signal(
                        remote,
                        SignalPayload::Offer {
                            sdp: offer,
                            kind: self.kind,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, remote = %remote, "Failed to swap video track: {}", e);
                }
            }
        }))
        .await;
    }

    // ========================================================================
    // EVENT PUMP HANDLERS
    // ========================================================================

    async fn on_link_event(&self, event: LinkEvent) {
        let link = self
            .inner
            .lock()
            .links
            .get(&event.remote)
            .filter(|link| link.id() == event.link_id)
            .cloned();
        // Events geschlossener oder ersetzter Links
        let Some(link) = link else {
            return;
        };

        match event.event {
            ConnectionEvent::StateChanged(state) => {
                if link.advance(state) {
                    self.on_link_state(&event.remote, state).await;
                }
            }
            ConnectionEvent::NegotiationTimedOut => {
                if link.negotiation_timed_out() {
                    self.on_link_state(&event.remote, LinkState::Failed).await;
                }
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                self.send_signal(&event.remote, SignalPayload::IceCandidate { candidate })
                    .await;
            }
            ConnectionEvent::RemoteTrack(track) => {
                link.add_remote_track(track.clone());
                self.emit(SessionEvent::RemoteTrack {
                    participant: event.remote,
                    track,
                });
            }
            ConnectionEvent::AudioLevel(level) => {
                let speaking = level >= self.config.speaking_threshold;
                let changed = {
                    let mut inner = self.inner.lock();
                    inner.participant_mut(&event.remote).and_then(|p| {
                        let speaking = speaking && p.audio_enabled;
                        (p.speaking != speaking).then(|| {
                            p.speaking = speaking;
                            p.clone()
                        })
                    })
                };
                if let Some(participant) = changed {
                    self.emit(SessionEvent::ParticipantChanged(participant));
                }
            }
        }
    }

    /// Übernimmt einen Link-Status in den Teilnehmer und leitet den Session-Status ab
    async fn on_link_state(&self, remote: &str, state: LinkState) {
        let (participant, transition) = {
            let mut inner = self.inner.lock();
            if !inner.is_live() {
                return;
            }
            let Some(participant) = inner.participant_mut(remote) else {
                return;
            };
            participant.connection = state;
            if state.is_terminal() {
                participant.speaking = false;
            }
            let participant = participant.clone();
            (participant, inner.evaluate())
        };

        tracing::debug!(session_id = %self.id, remote = %remote, "Peer link state: {:?}", state);
        self.emit(SessionEvent::ParticipantChanged(participant));

        // Ein terminaler Link wird nicht wiederverwendet
        if state.is_terminal() && state != LinkState::Closed {
            let link = self.inner.lock().links.remove(remote);
            if let Some(link) = link {
                link.close().await;
            }
        }

        match transition {
            Some(Transition::Activated) => {
                if let Some(deadline) = self.inner.lock().deadline.take() {
                    deadline.abort();
                }
                tracing::info!(session_id = %self.id, "Call session active");
                self.emit(SessionEvent::StateChanged(SessionState::Active));
            }
            Some(Transition::End(reason)) => {
                self.teardown(reason).await;
            }
            None => {}
        }
    }

    async fn on_connect_deadline(&self) {
        if self.state() == SessionState::Connecting {
            tracing::warn!(session_id = %self.id, "No peer connected before the deadline");
            self.teardown(EndReason::ConnectTimeout).await;
        }
    }

    fn emit_local_media(&self) {
        self.emit(SessionEvent::LocalMediaChanged {
            audio_enabled: self.media.is_audio_enabled(),
            video_enabled: self.media.is_video_enabled(),
            screen_sharing: self.media.is_screen_sharing(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Event-Pump: verarbeitet alle Session-Events nacheinander
async fn run_event_pump(
    session: Weak<CallSession>,
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut media_rx: broadcast::Receiver<MediaEvent>,
) {
    loop {
        tokio::select! {
            Some(control) = control_rx.recv() => {
                let Some(session) = session.upgrade() else { break };
                match control {
                    Control::ConnectDeadline => session.on_connect_deadline().await,
                    Control::Shutdown => break,
                }
            }
            Some(event) = link_rx.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.on_link_event(event).await;
            }
            media = media_rx.recv() => match media {
                Ok(MediaEvent::ScreenShareEnded { track_id }) => {
                    let Some(session) = session.upgrade() else { break };
                    session.on_screen_share_ended(&track_id).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Session event pump lagged by {} media events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            else => break,
        }
    }
    tracing::debug!("Session event pump stopped");
}
