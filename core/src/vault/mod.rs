use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::error::MigrationError;

/// Credential TTL defaults from §3.2.
pub mod ttl {
    use chrono::Duration;

    pub fn source_password() -> Duration {
        Duration::hours(48)
    }
    pub fn session_tokens() -> Duration {
        Duration::hours(48)
    }
    pub fn directory_one_time_token() -> Duration {
        Duration::hours(1)
    }
    pub fn invite_code() -> Duration {
        Duration::hours(48)
    }
}

/// An AEAD-encrypted field with its own expiry (§3.2, §4.7). The getter
/// ([`SecretVault::open`]) is the single place TTL is enforced — storage
/// contents alone never reveal whether a field is "live".
#[derive(Debug, Clone, Default)]
pub struct Encrypted<T> {
    ciphertext: Option<Vec<u8>>,
    nonce: Option<[u8; 12]>,
    expires_at: Option<DateTime<Utc>>,
    _marker: std::marker::PhantomData<T>,
}

/// Wire form used only for persistence round-tripping; the vault never
/// serializes the decrypted value itself.
#[derive(serde::Serialize, serde::Deserialize)]
struct EncryptedWire {
    ciphertext_b64: Option<String>,
    nonce_b64: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> serde::Serialize for Encrypted<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = EncryptedWire {
            ciphertext_b64: self.ciphertext.as_ref().map(|c| {
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, c)
            }),
            nonce_b64: self.nonce.as_ref().map(|n| {
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, n)
            }),
            expires_at: self.expires_at,
        };
        wire.serialize(serializer)
    }
}

impl<'de, T> serde::Deserialize<'de> for Encrypted<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = EncryptedWire::deserialize(deserializer)?;
        let ciphertext = wire
            .ciphertext_b64
            .map(|s| base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s))
            .transpose()
            .map_err(serde::de::Error::custom)?;
        let nonce = wire
            .nonce_b64
            .map(|s| base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s))
            .transpose()
            .map_err(serde::de::Error::custom)?
            .map(|v| {
                let mut arr = [0u8; 12];
                arr.copy_from_slice(&v[..12.min(v.len())]);
                arr
            });
        Ok(Encrypted {
            ciphertext,
            nonce,
            expires_at: wire.expires_at,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T> Encrypted<T> {
    pub fn empty() -> Self {
        Self {
            ciphertext: None,
            nonce: None,
            expires_at: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_none()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Raw bytes for persistence layer round-tripping; opaque to callers.
    pub fn raw_parts(&self) -> Option<(&[u8], [u8; 12], Option<DateTime<Utc>>)> {
        match (&self.ciphertext, &self.nonce) {
            (Some(ct), Some(nonce)) => Some((ct.as_slice(), *nonce, self.expires_at)),
            _ => None,
        }
    }

    pub fn from_raw_parts(
        ciphertext: Vec<u8>,
        nonce: [u8; 12],
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            ciphertext: Some(ciphertext),
            nonce: Some(nonce),
            expires_at,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Process-wide symmetric key for the Secret Vault (§4.7).
pub struct SecretVault {
    cipher: Aes256Gcm,
}

/// Deterministic development key, permitted only outside production (§4.7).
const DEV_KEY_SEED: &str = "atproto-migration-orchestrator-dev-key-do-not-use-in-production";

impl SecretVault {
    pub fn from_hex_key(hex_key: &str) -> Result<Self, MigrationError> {
        let bytes = Zeroizing::new(
            hex_decode(hex_key)
                .map_err(|e| MigrationError::Configuration(format!("invalid MASTER_KEY: {e}")))?,
        );
        if bytes.len() != 32 {
            return Err(MigrationError::Configuration(
                "MASTER_KEY must decode to exactly 32 bytes".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Fallback key derived from a fixed string. Callers must gate this on
    /// `Config::deployment_mode` never being production.
    pub fn development_key() -> Self {
        let digest = blake3_like_digest(DEV_KEY_SEED.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal<T: Serialize>(
        &self,
        value: &T,
        ttl: Duration,
    ) -> Result<Encrypted<T>, MigrationError> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| MigrationError::Validation(format!("vault serialize failed: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| MigrationError::Validation("vault encryption failed".to_string()))?;
        Ok(Encrypted {
            ciphertext: Some(ciphertext),
            nonce: Some(nonce_bytes),
            expires_at: Some(Utc::now() + ttl),
            _marker: std::marker::PhantomData,
        })
    }

    /// No-expiry variant, used for the rotation private key (§3.2: "retained,
    /// not auto-cleared").
    pub fn seal_durable<T: Serialize>(&self, value: &T) -> Result<Encrypted<T>, MigrationError> {
        let mut enc = self.seal(value, Duration::zero())?;
        enc.expires_at = None;
        Ok(enc)
    }

    /// Decrypts and returns the value iff present and unexpired as of `now`.
    /// This is the sole enforcement point for credential TTLs (§3.2).
    pub fn open<T: DeserializeOwned>(
        &self,
        enc: &Encrypted<T>,
        now: DateTime<Utc>,
    ) -> Option<T> {
        if let Some(expires_at) = enc.expires_at {
            if now >= expires_at {
                return None;
            }
        }
        let (ciphertext, nonce_bytes, _) = enc.raw_parts()?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Not a cryptographic primitive choice for the vault itself (the vault uses
/// AES-256-GCM) — only used to stretch the fixed dev seed string to 32 bytes.
fn blake3_like_digest(input: &[u8]) -> [u8; 32] {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut out = [0u8; 32];
    for (i, chunk) in out.chunks_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        i.hash(&mut hasher);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trips() {
        let vault = SecretVault::development_key();
        let enc = vault.seal(&"hunter2".to_string(), Duration::hours(1)).unwrap();
        let opened = vault.open(&enc, Utc::now());
        assert_eq!(opened, Some("hunter2".to_string()));
    }

    #[test]
    fn expired_field_returns_none() {
        let vault = SecretVault::development_key();
        let enc = vault.seal(&"hunter2".to_string(), Duration::hours(1)).unwrap();
        let opened = vault.open(&enc, Utc::now() + Duration::hours(2));
        assert_eq!(opened, None);
    }

    #[test]
    fn empty_field_returns_none() {
        let vault = SecretVault::development_key();
        let enc: Encrypted<String> = Encrypted::empty();
        assert_eq!(vault.open(&enc, Utc::now()), None);
    }

    #[test]
    fn durable_field_never_expires() {
        let vault = SecretVault::development_key();
        let enc = vault.seal_durable(&"zkeyprivhex".to_string()).unwrap();
        let opened = vault.open(&enc, Utc::now() + Duration::days(3650));
        assert_eq!(opened, Some("zkeyprivhex".to_string()));
    }
}
