//! Secret vault for per-item access credentials
//!
//! Credentials are sealed with AES-256-GCM under a versioned key ring.
//! Every blob carries the version of the key that sealed it, so retired
//! keys keep opening old blobs until they are re-sealed.
//!
//! Wire format of a blob: `{ "key_version": u32, "nonce": hex, "ciphertext": hex }`.
//! The ciphertext includes the 16-byte GCM tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::Result;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;

//
// ================= Key material =================
//

/// A 256-bit vault key. Never printed.
#[derive(Clone)]
pub struct VaultKey([u8; KEY_LENGTH]);

impl VaultKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|_| EngineError::Config("encryption key is not valid hex".to_string()))?;
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            EngineError::Config(format!(
                "encryption key must be {} bytes ({} hex characters)",
                KEY_LENGTH,
                KEY_LENGTH * 2
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Fresh random key, mostly for tests and key generation tooling.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Active key plus retired keys still needed to open older blobs
#[derive(Debug, Clone)]
pub struct KeyRing {
    active_version: u32,
    keys: BTreeMap<u32, VaultKey>,
}

impl KeyRing {
    pub fn new(active_version: u32, key: VaultKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(active_version, key);
        Self {
            active_version,
            keys,
        }
    }

    /// Register a retired key. The active key is never replaced this way.
    pub fn with_retired_key(mut self, version: u32, key: VaultKey) -> Self {
        if version != self.active_version {
            self.keys.insert(version, key);
        }
        self
    }

    pub fn active_version(&self) -> u32 {
        self.active_version
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.keys().copied()
    }
}

//
// ================= Blobs and tokens =================
//

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub key_version: u32,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("key_version", &self.key_version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Plaintext access credential. Lives only in memory: no serde, redacted
/// formatting.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token, for building the aggregator request body only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

//
// ================= Vault =================
//

pub struct Vault {
    ring: KeyRing,
}

impl Vault {
    pub fn new(ring: KeyRing) -> Self {
        info!(
            active_key_version = ring.active_version(),
            key_count = ring.keys.len(),
            "Vault initialized"
        );
        Self { ring }
    }

    /// Encrypt a credential under the active key with a fresh random nonce.
    pub fn seal(&self, plaintext: &AccessToken) -> Result<EncryptedBlob> {
        let version = self.ring.active_version;
        let key = self
            .ring
            .keys
            .get(&version)
            .ok_or_else(|| EngineError::Config(format!("active key version {} missing", version)))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.expose().as_bytes())
            .map_err(|_| EngineError::Integrity("credential encryption failed".to_string()))?;

        debug!(key_version = version, "Credential sealed");

        Ok(EncryptedBlob {
            key_version: version,
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a blob with the key matching its version tag.
    ///
    /// Any failure (unknown version, malformed nonce, tag mismatch, non-UTF-8
    /// plaintext) is reported as the same opaque integrity error.
    pub fn unseal(&self, blob: &EncryptedBlob) -> Result<AccessToken> {
        let key = self.ring.keys.get(&blob.key_version).ok_or_else(|| {
            EngineError::Integrity(format!("no key for version {}", blob.key_version))
        })?;

        if blob.nonce.len() != NONCE_LENGTH {
            return Err(EngineError::Integrity(
                "credential blob is malformed".to_string(),
            ));
        }

        let plaintext = key
            .cipher()
            .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_ref())
            .map_err(|_| {
                EngineError::Integrity("credential blob failed authentication".to_string())
            })?;

        let token = String::from_utf8(plaintext).map_err(|_| {
            EngineError::Integrity("credential blob failed authentication".to_string())
        })?;

        Ok(AccessToken(token))
    }

    pub fn needs_rotation(&self, blob: &EncryptedBlob) -> bool {
        blob.key_version != self.ring.active_version
    }

    /// Re-encrypt a blob under the active key.
    pub fn reseal(&self, blob: &EncryptedBlob) -> Result<EncryptedBlob> {
        let token = self.unseal(blob)?;
        self.seal(&token)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
