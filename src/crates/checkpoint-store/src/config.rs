//! Store configuration
//!
//! Everything is passed explicitly at construction; nothing is read from the
//! environment. A TOML file looks like:
//!
//! ```toml
//! list_page_size = 64
//!
//! [ttl]
//! default_ttl_minutes = 1440
//! refresh_on_read = true
//! sweep_interval_minutes = 60
//!
//! [pool]
//! min_connections = 5
//! max_connections = 20
//!
//! [encryption]
//! key = "base64-encoded 32 byte key"
//! ```

use crate::error::{CheckpointError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Length of an AES-256 key in bytes
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Upper bound on `ttl.default_ttl_minutes`, about 1000 years
pub const MAX_TTL_MINUTES: u64 = 1000 * 366 * 24 * 60;

/// Top-level store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Expiration policy
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Connection pool sizing, passed through to the backend
    #[serde(default)]
    pub pool: PoolConfig,

    /// Number of checkpoints fetched per backend round-trip in `list`
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,

    /// At-rest encryption of payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
}

fn default_list_page_size() -> usize {
    64
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: TtlConfig::default(),
            pool: PoolConfig::default(),
            list_page_size: default_list_page_size(),
            encryption: None,
        }
    }
}

/// TTL policy; no expiry when `default_ttl_minutes` is unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TtlConfig {
    /// Expiration window applied to every checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_minutes: Option<u64>,

    /// Whether a successful read resets the expiration clock
    #[serde(default)]
    pub refresh_on_read: bool,

    /// Period of the background sweeper, if one is started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_minutes: Option<u64>,
}

impl TtlConfig {
    /// TTL of `minutes`, no refresh
    pub fn minutes(minutes: u64) -> Self {
        Self {
            default_ttl_minutes: Some(minutes),
            ..Self::default()
        }
    }

    pub fn with_refresh_on_read(mut self, refresh: bool) -> Self {
        self.refresh_on_read = refresh;
        self
    }

    pub fn with_sweep_interval_minutes(mut self, minutes: u64) -> Self {
        self.sweep_interval_minutes = Some(minutes);
        self
    }

    /// `None` when unset or above [`MAX_TTL_MINUTES`]
    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.default_ttl_minutes
            .filter(|m| *m <= MAX_TTL_MINUTES)
            .and_then(|m| i64::try_from(m).ok())
            .and_then(chrono::Duration::try_minutes)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_minutes
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
        }
    }
}

/// Encryption key material
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Base64-encoded AES-256 key
    pub key: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EncryptionConfig {
    pub fn from_key(key: &[u8; ENCRYPTION_KEY_LEN]) -> Self {
        Self {
            key: BASE64.encode(key),
        }
    }

    /// Decode and length-check the key
    pub fn key_bytes(&self) -> Result<[u8; ENCRYPTION_KEY_LEN]> {
        let raw = BASE64
            .decode(self.key.trim())
            .map_err(|e| CheckpointError::Config(format!("encryption key is not base64: {}", e)))?;
        raw.as_slice().try_into().map_err(|_| {
            CheckpointError::Config(format!(
                "encryption key must be {} bytes, got {}",
                ENCRYPTION_KEY_LEN,
                raw.len()
            ))
        })
    }
}

impl StoreConfig {
    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_list_page_size(mut self, size: usize) -> Self {
        self.list_page_size = size;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(content)
            .map_err(|e| CheckpointError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            CheckpointError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded store config");
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.list_page_size == 0 {
            return Err(CheckpointError::Config(
                "list_page_size must be at least 1".to_string(),
            ));
        }
        if self.ttl.default_ttl_minutes == Some(0) {
            return Err(CheckpointError::Config(
                "ttl.default_ttl_minutes must be positive".to_string(),
            ));
        }
        if let Some(minutes) = self.ttl.default_ttl_minutes {
            if self.ttl.ttl().is_none() {
                return Err(CheckpointError::Config(format!(
                    "ttl.default_ttl_minutes must be at most {}, got {}",
                    MAX_TTL_MINUTES, minutes
                )));
            }
        }
        if self.ttl.sweep_interval_minutes == Some(0) {
            return Err(CheckpointError::Config(
                "ttl.sweep_interval_minutes must be positive".to_string(),
            ));
        }
        if self.ttl.sweep_interval_minutes.is_some() && self.ttl.sweep_interval().is_none() {
            return Err(CheckpointError::Config(
                "ttl.sweep_interval_minutes is out of range".to_string(),
            ));
        }
        if self.pool.max_connections == 0 || self.pool.min_connections > self.pool.max_connections
        {
            return Err(CheckpointError::Config(format!(
                "invalid pool bounds: min={} max={}",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if let Some(encryption) = &self.encryption {
            encryption.key_bytes()?;
        }
        Ok(())
    }
}
