//! Call Session Manager
//!
//! Einzige Stelle, die Call Sessions erstellt. Garantiert höchstens eine
//! laufende Session und verteilt eingehende Signaling-Nachrichten.

use super::call::{CallSession, SessionDeps};
use super::record::CallRecord;
use super::state::{CallDirection, CallError};
use crate::config::CallConfig;
use crate::media::{CallKind, CaptureBackend, HostCapture};
use crate::peer::{PeerConnector, RtcConnector};
use crate::roster::{ParticipantId, ParticipantInfo, RosterLookup};
use crate::signaling::{
    SignalEnvelope, SignalPayload, SignalingEvent, SignalingTransport, HANGUP_BUSY,
    HANGUP_DECLINED,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events für die einbettende Anwendung (Klingeln, Anruf gestartet)
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    IncomingCall {
        session_id: String,
        from: ParticipantId,
        kind: CallKind,
    },
    /// Der Anrufer hat aufgelegt bevor angenommen wurde
    IncomingCallCancelled { session_id: String },
    SessionStarted { session_id: String },
}

/// Eingehender Anruf, der noch nicht angenommen wurde
struct PendingIncoming {
    caller: ParticipantId,
    kind: CallKind,
    /// Signale in Ankunftsreihenfolge, beginnend mit dem Offer
    signals: Vec<(ParticipantId, SignalPayload)>,
}

enum Dispatch {
    Session(Arc<CallSession>),
    Stashed,
    Ringing(CallKind),
    Cancelled,
    Busy,
    Drop,
}

pub struct CallSessionManager {
    deps: SessionDeps,
    /// Lock-Reihenfolge: erst `active`, dann `incoming`
    active: Mutex<Option<Arc<CallSession>>>,
    incoming: Mutex<HashMap<String, PendingIncoming>>,
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl CallSessionManager {
    pub fn new(
        local: ParticipantInfo,
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            deps: SessionDeps {
                local,
                config,
                capture,
                connector,
                signaling,
            },
            active: Mutex::new(None),
            incoming: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Manager mit cpal-Mikrofon und WebRTC-Verbindungen
    ///
    /// Wer selbst Samples schreibt, übergibt einen Klon seines
    /// `RtcConnector` an `new`.
    pub fn with_host_backends(
        local: ParticipantInfo,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Self {
        let connector = Arc::new(RtcConnector::new(&config));
        Self::new(local, config, Arc::new(HostCapture::new()), connector, signaling)
    }

    pub fn local_id(&self) -> &str {
        &self.deps.local.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// Die laufende (noch nicht beendete) Session
    pub fn current_session(&self) -> Option<Arc<CallSession>> {
        self.active
            .lock()
            .as_ref()
            .filter(|session| !session.is_ended())
            .cloned()
    }

    /// Session-IDs eingehender Anrufe, die noch klingeln
    pub fn pending_incoming(&self) -> Vec<String> {
        self.incoming.lock().keys().cloned().collect()
    }

    // ========================================================================
    // OUTGOING
    // ========================================================================

    /// Startet einen ausgehenden Anruf an alle Teilnehmer des Rosters
    pub async fn start_call(
        &self,
        session_id: impl Into<String>,
        roster: Vec<ParticipantInfo>,
        kind: CallKind,
    ) -> Result<Arc<CallSession>, CallError> {
        let session = self.reserve(session_id.into(), kind, CallDirection::Outgoing, None)?;
        self.begin(session, roster).await
    }

    /// Startet einen Anruf an alle Mitglieder eines Raums
    pub async fn start_call_in_room(
        &self,
        room_id: &str,
        kind: CallKind,
        roster: &dyn RosterLookup,
    ) -> Result<Arc<CallSession>, CallError> {
        if self.current_session().is_some() {
            return Err(CallError::AlreadyInSession);
        }
        let members = roster.members(room_id).await?;
        self.start_call(room_id, members, kind).await
    }

    /// Beendet die laufende Session und gibt ihren Bericht zurück
    pub async fn end_active_call(&self) -> Result<CallRecord, CallError> {
        let session = self.current_session().ok_or(CallError::NoActiveCall)?;
        let record = session.end().await;
        self.clear_slot(&session);
        Ok(record)
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    /// Nimmt einen klingelnden Anruf an
    ///
    /// `kind` bestimmt die lokal angeforderten Geräte und darf vom Angebot
    /// abweichen (Videoanruf nur mit Audio annehmen).
    pub async fn accept_call(
        &self,
        session_id: &str,
        mut roster: Vec<ParticipantInfo>,
        kind: CallKind,
    ) -> Result<Arc<CallSession>, CallError> {
        let (session, caller, offered) = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|s| !s.is_ended()) {
                return Err(CallError::AlreadyInSession);
            }
            let pending = self
                .incoming
                .lock()
                .remove(session_id)
                .ok_or_else(|| CallError::UnknownSession(session_id.to_string()))?;

            let session = CallSession::new(
                session_id.to_string(),
                kind,
                CallDirection::Incoming,
                Some(pending.caller.clone()),
                self.deps.clone(),
            );
            for (from, payload) in pending.signals {
                session.buffer_signal(&from, payload);
            }
            *active = Some(Arc::clone(&session));
            (session, pending.caller, pending.kind)
        };

        if !roster.iter().any(|p| p.id == caller) {
            roster.push(ParticipantInfo::new(caller.clone(), caller));
        }
        tracing::info!(
            session_id = %session_id,
            "Accepting incoming {:?} call as {:?}",
            offered,
            kind
        );
        self.begin(session, roster).await
    }

    /// Lehnt einen klingelnden Anruf ab und benachrichtigt den Anrufer
    pub async fn reject_call(&self, session_id: &str, reason: Option<&str>) -> Result<(), CallError> {
        let pending = self
            .incoming
            .lock()
            .remove(session_id)
            .ok_or_else(|| CallError::UnknownSession(session_id.to_string()))?;

        tracing::info!(session_id = %session_id, caller = %pending.caller, "Rejecting incoming call");
        let envelope = SignalEnvelope::new(
            session_id,
            self.deps.local.id.clone(),
            pending.caller,
            SignalPayload::Hangup {
                reason: Some(reason.unwrap_or(HANGUP_DECLINED).to_string()),
            },
        );
        self.deps.signaling.send(envelope).await?;
        Ok(())
    }

    /// Verteilt eine eingehende Signaling-Nachricht
    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        if envelope.to != self.deps.local.id {
            tracing::debug!(to = %envelope.to, "Ignoring signal addressed to someone else");
            return;
        }
        let SignalEnvelope {
            session_id,
            from,
            payload,
            ..
        } = envelope;

        let dispatch = {
            let active = self.active.lock();
            let mut incoming = self.incoming.lock();
            let live = active.as_ref().filter(|s| !s.is_ended());

            if let Some(session) = live.filter(|s| s.id() == session_id) {
                Dispatch::Session(Arc::clone(session))
            } else if let Some(pending) = incoming.get_mut(&session_id) {
                if from == pending.caller && matches!(payload, SignalPayload::Hangup { .. }) {
                    incoming.remove(&session_id);
                    Dispatch::Cancelled
                } else {
                    pending.signals.push((from.clone(), payload.clone()));
                    Dispatch::Stashed
                }
            } else if let SignalPayload::Offer { kind, .. } = &payload {
                if live.is_some() {
                    Dispatch::Busy
                } else {
                    incoming.insert(
                        session_id.clone(),
                        PendingIncoming {
                            caller: from.clone(),
                            kind: *kind,
                            signals: vec![(from.clone(), payload.clone())],
                        },
                    );
                    Dispatch::Ringing(*kind)
                }
            } else {
                Dispatch::Drop
            }
        };

        match dispatch {
            Dispatch::Session(session) => session.handle_signal(&from, payload).await,
            Dispatch::Ringing(kind) => {
                tracing::info!(session_id = %session_id, from = %from, "Incoming {:?} call", kind);
                self.emit(ManagerEvent::IncomingCall {
                    session_id,
                    from,
                    kind,
                });
            }
            Dispatch::Cancelled => {
                tracing::info!(session_id = %session_id, "Incoming call cancelled by caller");
                self.emit(ManagerEvent::IncomingCallCancelled { session_id });
            }
            Dispatch::Busy => {
                tracing::info!(session_id = %session_id, from = %from, "Busy, rejecting incoming call");
                let envelope = SignalEnvelope::new(
                    session_id,
                    self.deps.local.id.clone(),
                    from,
                    SignalPayload::Hangup {
                        reason: Some(HANGUP_BUSY.to_string()),
                    },
                );
                if let Err(e) = self.deps.signaling.send(envelope).await {
                    tracing::warn!("Failed to send busy reply: {}", e);
                }
            }
            Dispatch::Stashed => {}
            Dispatch::Drop => {
                tracing::debug!(session_id = %session_id, "Dropped {} signal for unknown session", payload.name());
            }
        }
    }

    /// Leitet `SignalingEvent::Signal` an `handle_signal` weiter
    pub fn spawn_signal_router(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SignalingEvent::Signal(envelope)) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.handle_signal(envelope).await;
                    }
                    Ok(SignalingEvent::Disconnected) => {
                        tracing::warn!("Signaling disconnected, active calls keep running");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signal router lagged, {} signaling events lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Signal router stopped");
        })
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn reserve(
        &self,
        session_id: String,
        kind: CallKind,
        direction: CallDirection,
        caller: Option<ParticipantId>,
    ) -> Result<Arc<CallSession>, CallError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| !s.is_ended()) {
            return Err(CallError::AlreadyInSession);
        }
        let session = CallSession::new(session_id, kind, direction, caller, self.deps.clone());
        *active = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn begin(
        &self,
        session: Arc<CallSession>,
        roster: Vec<ParticipantInfo>,
    ) -> Result<Arc<CallSession>, CallError> {
        let started = session.begin(roster).await.and_then(|()| {
            if session.is_ended() {
                Err(CallError::Cancelled)
            } else {
                Ok(())
            }
        });
        match started {
            Ok(()) => {
                self.emit(ManagerEvent::SessionStarted {
                    session_id: session.id().to_string(),
                });
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id(), "Failed to start call: {}", e);
                session.abandon();
                self.clear_slot(&session);
                Err(e)
            }
        }
    }

    fn clear_slot(&self, session: &Arc<CallSession>) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *active = None;
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("local", &self.deps.local.id)
            .field("active", &self.current_session().map(|s| s.id().to_string()))
            .field("incoming", &self.pending_incoming())
            .finish()
    }
}
