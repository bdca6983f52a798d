//! Payload serialization and at-rest transforms
//!
//! Channel values and pending writes are turned into bytes by a
//! [`SerializerProtocol`]. A [`PayloadTransform`] can then rewrite those bytes
//! before they reach the backend (and undo it after reading); the bundled
//! [`AesGcmTransform`] encrypts with AES-256-GCM. [`EncryptedSerializer`] glues
//! the two together.
//!
//! Any failure on either side surfaces as `CheckpointError::Serialization`.

use crate::config::{EncryptionConfig, ENCRYPTION_KEY_LEN};
use crate::error::{CheckpointError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;

const NONCE_SIZE: usize = 12;

/// Protocol for serializing and deserializing checkpoint payloads
pub trait SerializerProtocol: Send + Sync + fmt::Debug {
    /// Serialize a value to bytes
    fn dumps(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads(&self, data: &[u8]) -> Result<serde_json::Value>;
}

/// JSON-based serializer (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Reversible byte transform applied to payloads at rest
pub trait PayloadTransform: Send + Sync + fmt::Debug {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a random nonce per payload
///
/// Output layout: `nonce[12] || ciphertext_with_tag`.
#[derive(Clone)]
pub struct AesGcmTransform {
    cipher: Aes256Gcm,
}

impl fmt::Debug for AesGcmTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesGcmTransform")
    }
}

impl AesGcmTransform {
    pub fn new(key: &[u8; ENCRYPTION_KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        Ok(Self::new(&config.key_bytes()?))
    }

    /// Generate a random key suitable for [`EncryptionConfig::from_key`]
    pub fn generate_key() -> [u8; ENCRYPTION_KEY_LEN] {
        let mut key = [0u8; ENCRYPTION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }
}

impl PayloadTransform for AesGcmTransform {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, data)
            .map_err(|e| CheckpointError::serialization(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_SIZE {
            return Err(CheckpointError::serialization(
                "encrypted payload too short",
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                CheckpointError::serialization("decryption failed: wrong key or corrupted payload")
            })
    }
}

/// Serializer whose output is passed through a [`PayloadTransform`]
#[derive(Debug, Clone)]
pub struct EncryptedSerializer {
    inner: Arc<dyn SerializerProtocol>,
    transform: Arc<dyn PayloadTransform>,
}

impl EncryptedSerializer {
    pub fn new(inner: Arc<dyn SerializerProtocol>, transform: Arc<dyn PayloadTransform>) -> Self {
        Self { inner, transform }
    }

    /// JSON serialization encrypted with AES-256-GCM
    pub fn aes_gcm(config: &EncryptionConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(JsonSerializer::new()),
            Arc::new(AesGcmTransform::from_config(config)?),
        ))
    }
}

impl SerializerProtocol for EncryptedSerializer {
    fn dumps(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let plain = self.inner.dumps(value)?;
        self.transform.encode(&plain)
    }

    fn loads(&self, data: &[u8]) -> Result<serde_json::Value> {
        let plain = self.transform.decode(data)?;
        self.inner.loads(&plain)
    }
}
