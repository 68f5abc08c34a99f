//! Link and transfer configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_CHUNK_SIZE, MAX_ENVELOPE_BYTES, encoded_chunk_len};

/// Default OTA slot size of the unit (0x1E0000).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 0x1E_0000;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the link to the remote unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Transport's single-message limit (encoded bytes).
    pub max_envelope_bytes: usize,
    /// Only attach to units whose advertised name contains this.
    pub device_name: Option<String>,
    /// How long discovery may run before giving up.
    pub scan_timeout_ms: u64,
    /// Telemetry frames kept for late subscribers.
    pub telemetry_history: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: MAX_ENVELOPE_BYTES,
            device_name: None,
            scan_timeout_ms: 10_000,
            telemetry_history: 256,
        }
    }
}

impl LinkConfig {
    /// Discovery timeout.
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

/// Tuning for the firmware transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Raw image bytes per chunk.
    pub chunk_size: usize,
    /// Attempts at sending `START_FW_UPDATE`.
    pub init_attempts: u32,
    /// Pause between failed start attempts.
    pub init_retry_delay_ms: u64,
    /// Pause after a successful start so the unit can prepare storage.
    pub init_settle_ms: u64,
    /// Attempts per chunk (send + ack).
    pub chunk_attempts: u32,
    /// Pause between failed chunk attempts.
    pub chunk_retry_delay_ms: u64,
    /// How long to wait for a chunk ack.
    pub ack_timeout_ms: u64,
    /// How long to wait for the verify result.
    pub verify_timeout_ms: u64,
    /// Largest image the unit can hold.
    pub max_image_bytes: usize,
    /// Share of the progress range (percent) used by the chunk transfer.
    pub transfer_progress_ceiling: u8,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            init_attempts: 3,
            init_retry_delay_ms: 1_000,
            init_settle_ms: 2_000,
            chunk_attempts: 3,
            chunk_retry_delay_ms: 500,
            ack_timeout_ms: 5_000,
            verify_timeout_ms: 10_000,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            transfer_progress_ceiling: 90,
        }
    }
}

impl TransferConfig {
    #[must_use]
    pub const fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }

    #[must_use]
    pub const fn init_settle(&self) -> Duration {
        Duration::from_millis(self.init_settle_ms)
    }

    #[must_use]
    pub const fn chunk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_delay_ms)
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// Check the settings against the transport's envelope limit.
    ///
    /// # Errors
    /// Returns error if a chunk envelope would not fit in one message, or a
    /// count is zero.
    pub fn validate(&self, max_envelope_bytes: usize) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        let encoded = encoded_chunk_len(self.chunk_size);
        if encoded > max_envelope_bytes {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} encodes to {encoded} bytes, over the {max_envelope_bytes}-byte envelope limit",
                self.chunk_size
            )));
        }
        if self.init_attempts == 0 || self.chunk_attempts == 0 {
            return Err(ConfigError::Invalid("attempt counts must be positive".into()));
        }
        if self.transfer_progress_ceiling > 100 {
            return Err(ConfigError::Invalid(
                "transfer_progress_ceiling must be at most 100".into(),
            ));
        }
        Ok(())
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Parse from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or the result is invalid.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate the combined settings.
    ///
    /// # Errors
    /// Returns error if the transfer settings do not fit the link.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate(self.link.max_envelope_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.transfer.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.transfer.init_settle(), Duration::from_secs(2));
        assert_eq!(config.transfer.chunk_attempts, 3);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = Config::from_json_str(r#"{"transfer":{"chunk_size":128}}"#).unwrap();
        assert_eq!(config.transfer.chunk_size, 128);
        assert_eq!(config.transfer.init_attempts, 3);
        assert_eq!(config.link.max_envelope_bytes, MAX_ENVELOPE_BYTES);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let err = Config::from_json_str(r#"{"transfer":{"chunk_size":400}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        // fits once the link allows larger messages
        tokio_test::assert_ok!(Config::from_json_str(
            r#"{"link":{"max_envelope_bytes":1024},"transfer":{"chunk_size":400}}"#,
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = Config::from_json_str(r#"{"transfer":{"chunk_attempts":0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
