//! Session Configuration
//!
//! TOML-backed settings for a session manager and its HTTP transport.
//!
//! ```toml
//! identifier = "downloads"
//! max_concurrent_operations = 4
//! request_timeout_secs = 30
//!
//! [security]
//! pinning_mode = "fingerprint"
//! pinned_sha256 = ["2b1f...base64..."]
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::security::{PinningMode, SecurityPolicy};

/// Session manager and transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name used for logging and dispatcher labels
    pub identifier: String,
    /// Cap on concurrently executing operations; `None` = unbounded
    pub max_concurrent_operations: Option<usize>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Offer completed responses for caching
    pub cache_responses: bool,
    pub security: SecurityConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identifier: "netops".to_string(),
            max_concurrent_operations: None,
            request_timeout_secs: 60,
            connect_timeout_secs: 10,
            user_agent: format!("netops/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            cache_responses: false,
            security: SecurityConfig::default(),
        }
    }
}

/// `[security]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub pinning_mode: PinningMode,
    /// Base64 SHA-256 certificate fingerprints
    pub pinned_sha256: Vec<String>,
    pub allow_invalid_certificates: bool,
    pub validates_domain_name: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pinning_mode: PinningMode::None,
            pinned_sha256: Vec::new(),
            allow_invalid_certificates: false,
            validates_domain_name: true,
        }
    }
}

impl SessionConfig {
    /// Parse from TOML text; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.security.decode_fingerprints()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading session config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Build the trust policy described by the `[security]` table
    pub fn security_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        Ok(SecurityPolicy {
            pinning_mode: self.security.pinning_mode,
            pinned_certificates: Vec::new(),
            pinned_fingerprints: self.security.decode_fingerprints()?,
            allow_invalid_certificates: self.security.allow_invalid_certificates,
            validates_domain_name: self.security.validates_domain_name,
        })
    }
}

impl SecurityConfig {
    fn decode_fingerprints(&self) -> Result<Vec<[u8; 32]>, ConfigError> {
        self.pinned_sha256
            .iter()
            .map(|pin| {
                let raw = STANDARD
                    .decode(pin.trim())
                    .map_err(|e| ConfigError::InvalidFingerprint(format!("{}: {}", pin, e)))?;
                <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
                    ConfigError::InvalidFingerprint(format!(
                        "{}: expected 32 bytes, got {}",
                        pin,
                        raw.len()
                    ))
                })
            })
            .collect()
    }
}
