//! Delivery wire frames.
//!
//! Frames are JSON with base64 byte fields and must fit the transport's
//! frame ceiling (`max_payload_bytes`); oversize frames are refused in both
//! directions.

use std::fmt;

use beam_types::{AttestationEnvelope, BeamError, BundleTransaction, OfflineBundle, Result};
use serde::{Deserialize, Serialize};

/// A bundle plus whatever attestation envelopes the sender holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub bundle: OfflineBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_attestation: Option<AttestationEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_attestation: Option<AttestationEnvelope>,
}

impl DeliveryPayload {
    #[must_use]
    pub fn new(bundle: OfflineBundle) -> Self {
        Self {
            bundle,
            payer_attestation: None,
            merchant_attestation: None,
        }
    }

    /// Build from a stored transaction.
    ///
    /// # Errors
    /// `Internal` if the record no longer holds its bundle.
    pub fn from_transaction(txn: &BundleTransaction) -> Result<Self> {
        let bundle = txn
            .bundle
            .clone()
            .ok_or_else(|| BeamError::Internal(format!("{}: no bundle to deliver", txn.id)))?;
        Ok(Self {
            bundle,
            payer_attestation: txn.payer_attestation.clone(),
            merchant_attestation: txn.merchant_attestation.clone(),
        })
    }

    #[must_use]
    pub fn bundle_id(&self) -> &str {
        &self.bundle.tx_id
    }

    /// Envelopes carried, for handing to the receiving manager.
    #[must_use]
    pub fn attestations(&self) -> Vec<AttestationEnvelope> {
        self.payer_attestation
            .iter()
            .chain(self.merchant_attestation.iter())
            .cloned()
            .collect()
    }
}

/// Why a peer refused a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// Nonce or timestamp already superseded.
    Stale,
    Unauthorized,
    /// Malformed or failing signature checks.
    Invalid,
    Other(String),
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => write!(f, "STALE"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::Invalid => write!(f, "INVALID"),
            Self::Other(reason) => write!(f, "OTHER({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryFrame {
    Bundle(DeliveryPayload),
    Ack { bundle_id: String },
    Nack { bundle_id: String, reason: NackReason },
}

impl DeliveryFrame {
    #[must_use]
    pub fn bundle_id(&self) -> &str {
        match self {
            Self::Bundle(payload) => payload.bundle_id(),
            Self::Ack { bundle_id } | Self::Nack { bundle_id, .. } => bundle_id,
        }
    }
}

/// Serialize a frame, refusing anything above `max_bytes`.
pub fn encode_frame(frame: &DeliveryFrame, max_bytes: usize) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > max_bytes {
        return Err(BeamError::PayloadTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(bytes)
}

/// Parse a frame; the size check runs before any parsing.
pub fn decode_frame(bytes: &[u8], max_bytes: usize) -> Result<DeliveryFrame> {
    if bytes.len() > max_bytes {
        return Err(BeamError::PayloadTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}
