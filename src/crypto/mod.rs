//! Crypto Module - Ed25519 Identität für das Signaling
//!
//! - Persistenter Signaturschlüssel pro Gerät
//! - Signierung und Prüfung von Signaling-Frames

mod keypair;

pub use keypair::{KeyPair, KeyPairError};
