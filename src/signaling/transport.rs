//! Signaling Transport - ausgehende Seite des Signaling-Vertrags
//!
//! Zustellung und Wiederholung sind Sache des Transports. Die Session
//! protokolliert fehlgeschlagene Sendungen nur; ein Link ohne Antwort
//! läuft in seinen Negotiation-Timeout.

use super::messages::SignalEnvelope;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Sendet eine Nachricht an `envelope.to`
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}
