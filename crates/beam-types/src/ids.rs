//! Identifiers used throughout Beam.
//!
//! Accounts and parties are addressed by raw 32-byte ed25519 public keys
//! ([`Pubkey`]). Bundles are addressed by their free-form `tx_id` string and,
//! on the ledger, by its SHA-256 digest ([`BundleHash`]).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{BeamError, Result, constants};

// ---------------------------------------------------------------------------
// Pubkey
// ---------------------------------------------------------------------------

/// A 32-byte public key or derived account address.
///
/// Serialized as a lowercase hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing unless it is exactly 32 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] =
            bytes
                .try_into()
                .map_err(|_| BeamError::InvalidAttestationInput {
                    reason: format!("public key must be 32 bytes, got {}", bytes.len()),
                })?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// First four bytes in hex, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Pubkey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Pubkey {
    type Err = BeamError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| BeamError::Serialization(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Bundle identifiers
// ---------------------------------------------------------------------------

/// SHA-256 digest of a bundle id, as stored in the nonce registry.
pub type BundleHash = [u8; 32];

/// Validate a bundle id: 1 to 128 bytes.
pub fn validate_bundle_id(bundle_id: &str) -> Result<()> {
    if bundle_id.is_empty() || bundle_id.len() > constants::MAX_BUNDLE_ID_LEN {
        return Err(BeamError::InvalidBundleId);
    }
    Ok(())
}

/// Ledger-side hash of a bundle id: `SHA-256(bundle_id)`.
#[must_use]
pub fn bundle_hash(bundle_id: &str) -> BundleHash {
    Sha256::digest(bundle_id.as_bytes()).into()
}
