//! WebSocket Client für den Signaling-Server
//!
//! - Registrierung mit Ed25519-signierten Frames
//! - Heartbeat-Keeping
//! - Weiterleitung eingehender Session-Signale als Events

use super::messages::{ClientFrame, ServerFrame, SignalEnvelope};
use super::transport::{SignalingError, SignalingTransport};
use crate::config::SignalingConfig;
use crate::crypto::KeyPair;
use crate::roster::ParticipantId;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    Registered { participant_id: ParticipantId },
    /// Eingehende Session-Nachricht
    Signal(SignalEnvelope),
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    participant_id: Option<ParticipantId>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

pub struct SignalingClient {
    config: SignalingConfig,
    keypair: Arc<KeyPair>,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig, keypair: Arc<KeyPair>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            keypair,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Registrierte Teilnehmer-ID
    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.state.read().participant_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server und registriert den Teilnehmer
    pub async fn connect_and_register(
        &self,
        participant_id: ParticipantId,
    ) -> Result<(), SignalingError> {
        let ws_url = websocket_url(&self.config.url)?;
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);
        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die Registrierungs-Antwort
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<ParticipantId, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => Self::handle_server_frame(frame, &state, &event_tx, &reg_tx),
                        Err(e) => tracing::warn!("Ignoring unparseable server frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut s = state.write();
                s.is_connected = false;
                s.participant_id = None;
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.send_frame(ClientFrame::Register {
            participant_id,
            public_key: self.keypair.public_key_base64(),
        })
        .await?;

        let timeout = Duration::from_secs(self.config.register_timeout_secs);
        let result = tokio::select! {
            result = reg_rx.recv() => match result {
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => Err(e),
                None => Err(SignalingError::RegistrationFailed("No response".to_string())),
            },
            _ = tokio::time::sleep(timeout) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        };

        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Trennt die Verbindung; der Write-Task schließt den Socket
    pub fn disconnect(&self) {
        if self.tx.write().take().is_some() {
            tracing::info!("Disconnecting from signaling server");
        }
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Der erste Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(participant_id) = client.participant_id() else {
                    break;
                };
                if let Err(e) = client.send_frame(ClientFrame::Heartbeat { participant_id }).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });
    }

    /// Signiert und sendet einen Frame
    async fn send_frame(&self, frame: ClientFrame) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        let message = self.sign_frame(&frame)?;

        tx.send(message)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Fügt Timestamp und Signatur hinzu
    fn sign_frame(&self, frame: &ClientFrame) -> Result<String, SignalingError> {
        let mut signable = serde_json::to_value(frame)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;

        let obj = signable
            .as_object_mut()
            .ok_or_else(|| SignalingError::InvalidMessage("frame is not an object".to_string()))?;
        obj.insert(
            "timestamp".to_string(),
            Value::Number(Utc::now().timestamp_millis().into()),
        );

        let signature = self.keypair.sign_message(&signable);
        if let Some(obj) = signable.as_object_mut() {
            obj.insert("signature".to_string(), Value::String(signature));
        }

        serde_json::to_string(&signable).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    fn handle_server_frame(
        frame: ServerFrame,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<ParticipantId, SignalingError>>,
    ) {
        match frame {
            ServerFrame::Registered { participant_id, .. } => {
                tracing::info!("Registered as {}", participant_id);
                state.write().participant_id = Some(participant_id.clone());
                let _ = reg_tx.try_send(Ok(participant_id.clone()));
                let _ = event_tx.send(SignalingEvent::Registered { participant_id });
            }

            ServerFrame::Signal { envelope, .. } => {
                tracing::debug!(
                    session_id = %envelope.session_id,
                    from = %envelope.from,
                    "Received {} signal",
                    envelope.payload.name()
                );
                let _ = event_tx.send(SignalingEvent::Signal(envelope));
            }

            ServerFrame::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Während der Registrierung wartet connect_and_register darauf
                let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerFrame::Pong { .. } => {}
        }
    }
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.participant_id().is_none() {
            return Err(SignalingError::NotConnected);
        }
        self.send_frame(ClientFrame::Signal { envelope }).await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("url", &self.config.url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// http(s) → ws(s); ohne Pfad wird `/ws` angehängt
fn websocket_url(base: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed(format!("cannot use scheme {}", scheme)))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================
