//! Ed25519 Signaturschlüssel für Signaling-Frames
//!
//! Jeder Client signiert seine Frames an den Signaling-Server. Signiert wird
//! der JSON-String aller Felder außer `signature`, rekursiv nach Keys sortiert.
//!
//! ## Verwendung
//! ```no_run
//! # use call_core::crypto::KeyPair;
//! let keypair = KeyPair::load_or_create(KeyPair::default_key_path()?)?;
//! let frame = serde_json::json!({ "type": "heartbeat", "timestamp": 0 });
//! let signature = keypair.sign_message(&frame);
//! KeyPair::verify_message(&keypair.public_key_base64(), &frame, &signature)?;
//! # Ok::<(), call_core::crypto::KeyPairError>(())
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature does not match")]
    InvalidSignature,
}

// ============================================================================
// KEYPAIR
// ============================================================================

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt den Schlüssel aus `path` oder erzeugt und speichert einen neuen
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, KeyPairError> {
        let path = path.as_ref();

        if path.exists() {
            tracing::info!("Loading signing key from {:?}", path);
            Self::load_from_file(path)
        } else {
            tracing::info!("Creating new signing key at {:?}", path);
            let keypair = Self::generate();
            keypair.save_to_file(path)?;
            Ok(keypair)
        }
    }

    /// Standardpfad im Datenverzeichnis der Plattform
    ///
    /// - Linux: `~/.local/share/call-core/keys/signing.key`
    /// - macOS: `~/Library/Application Support/org.call-core.call-core/keys/signing.key`
    pub fn default_key_path() -> Result<PathBuf, KeyPairError> {
        let proj_dirs = directories::ProjectDirs::from("org", "call-core", "call-core")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join("keys").join("signing.key"))
    }

    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let key_bytes = decode_key(encoded.trim())?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Signiert einen Frame; ein vorhandenes `signature`-Feld wird ignoriert
    pub fn sign_message(&self, frame: &Value) -> String {
        self.sign_base64(canonical_json(frame).as_bytes())
    }

    /// Prüft die Signatur eines Frames gegen einen Base64 Public Key
    pub fn verify_message(
        public_key: &str,
        frame: &Value,
        signature: &str,
    ) -> Result<(), KeyPairError> {
        let key_bytes = decode_key(public_key)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyPairError::InvalidPublicKey)?;

        let signature_bytes: [u8; 64] = BASE64
            .decode(signature)?
            .try_into()
            .map_err(|_| KeyPairError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_bytes);

        verifying_key
            .verify(canonical_json(frame).as_bytes(), &signature)
            .map_err(|_| KeyPairError::InvalidSignature)
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], KeyPairError> {
    let bytes = BASE64.decode(encoded)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyPairError::InvalidKeyLength(len))
}

/// JSON-String mit rekursiv sortierten Keys, ohne `signature`
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().filter(|k| *k != "signature").collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }

    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_and_signature_sizes() {
        let keypair = KeyPair::generate();

        // 32 bytes = 44 Zeichen, 64 bytes = 88 Zeichen
        assert_eq!(keypair.public_key_base64().len(), 44);
        assert_eq!(keypair.sign_base64(b"frame").len(), 88);
    }

    #[test]
    fn test_signature_ignores_key_order_and_signature_field() {
        let keypair = KeyPair::generate();
        let frame = json!({ "type": "register", "participantId": "alice", "timestamp": 1 });
        let reordered = json!({
            "timestamp": 1,
            "participantId": "alice",
            "type": "register",
            "signature": "ignored"
        });

        let signature = keypair.sign_message(&frame);
        assert_eq!(signature, keypair.sign_message(&reordered));
        assert!(KeyPair::verify_message(&keypair.public_key_base64(), &reordered, &signature).is_ok());
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let keypair = KeyPair::generate();
        let frame = json!({ "type": "signal", "to": "bob", "timestamp": 1 });
        let signature = keypair.sign_message(&frame);

        let tampered = json!({ "type": "signal", "to": "mallory", "timestamp": 1 });
        assert!(matches!(
            KeyPair::verify_message(&keypair.public_key_base64(), &tampered, &signature),
            Err(KeyPairError::InvalidSignature)
        ));
    }

    #[test]
    fn test_load_or_create_persists() {
        let path = std::env::temp_dir()
            .join(format!("call-core-{}", uuid::Uuid::new_v4()))
            .join("signing.key");

        let created = KeyPair::load_or_create(&path).unwrap();
        let loaded = KeyPair::load_or_create(&path).unwrap();
        assert_eq!(created.public_key_base64(), loaded.public_key_base64());

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}
