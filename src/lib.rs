//! Call Core - Sitzungs- und Verbindungskern für Sprach- und Videoanrufe
//!
//! Verwaltet den Lebenszyklus eines Anrufs mit:
//! - Lokalen Capture-Geräten (Mikrofon, Kamera, Bildschirm)
//! - Einer WebRTC Peer Connection pro Remote-Teilnehmer (Mesh)
//! - Signaling über einen WebSocket-Server mit Ed25519-signierten Frames
//! - SQLite als lokale Roster-Quelle
//!
//! ```no_run
//! use call_core::{CallConfig, CallKind, CallSessionManager, KeyPair, ParticipantInfo, SignalingClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! call_core::init_logging();
//! let config = CallConfig::from_env()?;
//! let keypair = Arc::new(KeyPair::load_or_create(KeyPair::default_key_path()?)?);
//!
//! let signaling = Arc::new(SignalingClient::new(config.signaling.clone(), keypair));
//! let events = signaling.subscribe();
//! signaling.connect_and_register("alice".to_string()).await?;
//! signaling.start_heartbeat();
//!
//! let manager = Arc::new(CallSessionManager::with_host_backends(
//!     ParticipantInfo::new("alice", "Alice"),
//!     config,
//!     signaling,
//! ));
//! manager.spawn_signal_router(events);
//!
//! let session = manager
//!     .start_call("chat-1", vec![ParticipantInfo::new("bob", "Bob")], CallKind::Audio)
//!     .await?;
//! let record = session.end().await;
//! println!("call lasted {:?}", record.duration);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod media;
pub mod peer;
pub mod roster;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::{CallConfig, ConfigError, IceServerConfig, SignalingConfig};
pub use crypto::{KeyPair, KeyPairError};
pub use media::{CallKind, CaptureBackend, LocalTrack, MediaError, MediaSource, TrackKind};
pub use peer::{LinkState, NegotiationError, PeerLink};
pub use roster::{ParticipantId, ParticipantInfo, RosterError, RosterLookup, SqliteRoster};
pub use session::{
    CallDirection, CallError, CallRecord, CallSession, CallSessionManager, EndReason,
    ManagerEvent, Participant, SessionEvent, SessionState,
};
pub use signaling::{SignalEnvelope, SignalPayload, SignalingClient, SignalingError, SignalingEvent};

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert einen `tracing` Subscriber
///
/// Filter aus `RUST_LOG`, ergänzt um `call_core=debug` und `webrtc=warn`.
/// Ein zweiter Aufruf ist ein No-op.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["call_core=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}
