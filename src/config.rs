//! Konfiguration für Call Sessions
//!
//! Enthält ICE-Server, Timeouts und Signaling-Einstellungen.
//! Defaults sind so gewählt, dass ein Aufruf ohne Konfiguration funktioniert;
//! Umgebungsvariablen können einzelne Werte überschreiben.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: String::new(),
            credential: String::new(),
        },
    ]
}

// ============================================================================
// SIGNALING CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Basis-URL des Signaling-Servers (http(s) oder ws(s))
    pub url: String,
    /// Heartbeat-Intervall in Sekunden
    pub heartbeat_secs: u64,
    /// Maximale Wartezeit auf die Registrierungs-Antwort
    pub register_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".to_string(),
            heartbeat_secs: 25,
            register_timeout_secs: 10,
        }
    }
}

// ============================================================================
// CALL CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Zeit bis eine Session ohne verbundenen Peer beendet wird
    pub connect_timeout_secs: u64,
    /// Zeit bis ein einzelner Peer Link ohne Verbindung als fehlgeschlagen gilt
    pub negotiation_timeout_secs: u64,
    /// RMS-Schwelle ab der ein Teilnehmer als sprechend gilt
    pub speaking_threshold: f32,
    /// Kapazität der Event-Channels
    pub event_capacity: usize,
    pub signaling: SignalingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            connect_timeout_secs: 30,
            negotiation_timeout_secs: 20,
            speaking_threshold: 0.02,
            event_capacity: 100,
            signaling: SignalingConfig::default(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus einer JSON-Datei
    ///
    /// Fehlende Felder werden mit Defaults gefüllt.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&raw)?;
        tracing::debug!("Loaded call config from {:?}", path.as_ref());
        Ok(config)
    }

    /// Defaults plus Überschreibungen aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Wendet Überschreibungen aus einer beliebigen Quelle an
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CALL_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Some(value) = lookup("CALL_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = parse_secs("CALL_CONNECT_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("CALL_NEGOTIATION_TIMEOUT_SECS") {
            self.negotiation_timeout_secs = parse_secs("CALL_NEGOTIATION_TIMEOUT_SECS", value)?;
        }

        // TURN nur wenn alle drei Werte gesetzt sind
        if let (Some(url), Some(username), Some(credential)) = (
            lookup("CALL_TURN_URL"),
            lookup("CALL_TURN_USERNAME"),
            lookup("CALL_TURN_CREDENTIAL"),
        ) {
            self.add_turn_server(url, username, credential);
        }

        Ok(())
    }

    /// Fügt einen TURN-Server hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// ICE-Server im Format von webrtc-rs
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect()
    }
}

fn parse_secs(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
