//! Configuration types for the ledger program and device clients.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BeamError, Result, constants};

/// Escrow program configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Public key of the attestation verifier service.
    pub verifier_key: [u8; 32],
    /// Freshness window for attestation timestamps, seconds.
    pub max_attestation_age_secs: i64,
    /// Reject offline settlements that carry no payer proof.
    pub enforce_offline_attestation: bool,
}

impl LedgerConfig {
    #[must_use]
    pub fn new(verifier_key: [u8; 32]) -> Self {
        Self {
            verifier_key,
            max_attestation_age_secs: constants::MAX_ATTESTATION_AGE_SECS,
            enforce_offline_attestation: false,
        }
    }
}

/// Delivery acknowledgement protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ack_timeout_ms: u64,
    /// Consecutive failures (timeouts or nacks) that demote a delivery to the
    /// queue. Each earlier failure triggers a resend after backoff.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Durable queue capacity; oldest evicted beyond it.
    pub queue_capacity: usize,
    pub flush_interval_ms: u64,
    /// Transport frame ceiling.
    pub max_payload_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: constants::DEFAULT_ACK_TIMEOUT_MS,
            max_retries: constants::DEFAULT_MAX_DELIVERY_RETRIES,
            backoff_base_ms: constants::DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: constants::DEFAULT_BACKOFF_CAP_MS,
            queue_capacity: constants::DEFAULT_DELIVERY_QUEUE_CAPACITY,
            flush_interval_ms: constants::DEFAULT_FLUSH_INTERVAL_MS,
            max_payload_bytes: constants::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl DeliveryConfig {
    /// Backoff before retry number `retry_count` (0-based):
    /// `base × 2^retry_count`, capped.
    #[must_use]
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
    }
}

/// Background attestation retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationRetryConfig {
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    /// Give up this long after the first enqueue.
    pub abandon_after_secs: i64,
    pub capacity: usize,
}

impl Default for AttestationRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: constants::DEFAULT_ATTESTATION_RETRY_BASE_SECS,
            max_delay_secs: constants::DEFAULT_ATTESTATION_RETRY_MAX_SECS,
            abandon_after_secs: constants::DEFAULT_ATTESTATION_ABANDON_SECS,
            capacity: constants::DEFAULT_ATTESTATION_QUEUE_CAPACITY,
        }
    }
}

/// Device client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory holding the local stores.
    pub data_dir: String,
    /// Transaction log capacity.
    pub log_capacity: usize,
    pub delivery: DeliveryConfig,
    pub attestation_retry: AttestationRetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: "./beam-data".to_string(),
            log_capacity: constants::DEFAULT_LOG_CAPACITY,
            delivery: DeliveryConfig::default(),
            attestation_retry: AttestationRetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BeamError::Configuration(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| BeamError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 {
            return Err(BeamError::Configuration("log_capacity must be > 0".into()));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(BeamError::Configuration(
                "delivery.queue_capacity must be > 0".into(),
            ));
        }
        if self.delivery.ack_timeout_ms == 0 {
            return Err(BeamError::Configuration(
                "delivery.ack_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}
