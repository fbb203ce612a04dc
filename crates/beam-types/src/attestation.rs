//! Attestation data types.
//!
//! An [`AttestationEnvelope`] is what a device receives from the attestation
//! verifier service for one (bundle, role) pair. The ledger only needs the
//! compact [`AttestationProof`] projection of it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which party an attestation speaks for. The discriminant is part of the
/// attestation root preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttestationRole {
    Payer,
    Merchant,
}

impl AttestationRole {
    /// Byte used in the attestation root preimage.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Payer => 0,
            Self::Merchant => 1,
        }
    }
}

impl fmt::Display for AttestationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payer => write!(f, "PAYER"),
            Self::Merchant => write!(f, "MERCHANT"),
        }
    }
}

/// Hardware security level reported by the device key attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    Software,
    TrustedEnvironment,
    StrongBox,
}

/// Device description carried alongside an attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub model: String,
    pub security_level: SecurityLevel,
}

/// Verifier-issued attestation for one (bundle, role) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationEnvelope {
    pub bundle_id: String,
    pub role: AttestationRole,
    /// Attestation time, unix seconds.
    pub timestamp: i64,
    /// Random attestation nonce.
    #[serde(with = "crate::encoding::b64_array")]
    pub nonce: [u8; 32],
    /// The signed payload: the attestation root at issuance.
    #[serde(with = "crate::encoding::b64_array")]
    pub attestation_root: [u8; 32],
    /// Verifier signature over `attestation_root`.
    #[serde(with = "crate::encoding::b64_array")]
    pub signature: [u8; 64],
    /// Raw platform attestation report.
    #[serde(with = "crate::encoding::b64")]
    pub attestation_report: Vec<u8>,
    /// DER certificates, leaf first.
    #[serde(with = "crate::encoding::b64_vec")]
    pub certificate_chain: Vec<Vec<u8>>,
    pub device_info: DeviceInfo,
}

impl AttestationEnvelope {
    /// Project onto the compact proof submitted to the ledger.
    #[must_use]
    pub fn to_proof(&self) -> AttestationProof {
        AttestationProof {
            attestation_root: self.attestation_root,
            attestation_nonce: self.nonce,
            attestation_timestamp: self.timestamp,
            verifier_signature: self.signature,
        }
    }
}

/// Attestation proof as consumed by settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationProof {
    #[serde(with = "crate::encoding::b64_array")]
    pub attestation_root: [u8; 32],
    #[serde(with = "crate::encoding::b64_array")]
    pub attestation_nonce: [u8; 32],
    pub attestation_timestamp: i64,
    #[serde(with = "crate::encoding::b64_array")]
    pub verifier_signature: [u8; 64],
}

/// Optional proofs accompanying a settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvidence {
    pub payer_proof: Option<AttestationProof>,
    pub merchant_proof: Option<AttestationProof>,
}

impl SettlementEvidence {
    /// No proofs: direct online settlement.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

/// How the bundle reached the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SettlementMode {
    /// Both parties online; wallet signatures suffice.
    #[default]
    Online,
    /// Created offline; hardware attestation expected.
    Offline,
}
