//! Attestation root computation.
//!
//! The root binds an attestation to one party's view of one bundle at one
//! moment:
//!
//! ```text
//! SHA-256( "beam.attestation.v1"
//!        || bundle_id (UTF-8)
//!        || payer (32) || merchant (32)
//!        || amount (u64 LE) || bundle_nonce (u64 LE)
//!        || role (u8: payer=0, merchant=1)
//!        || attestation_nonce (32)
//!        || attestation_timestamp (i64 LE) )
//! ```
//!
//! Field order and byte order are a wire contract shared by the ledger, the
//! verifier service, and every client.

use beam_types::{AttestationRole, BeamError, OfflineBundle, Pubkey, Result, constants};
use sha2::{Digest, Sha256};

/// Compute the 32-byte attestation root.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn compute_attestation_root(
    role: AttestationRole,
    bundle_id: &str,
    payer: &Pubkey,
    merchant: &Pubkey,
    amount: u64,
    bundle_nonce: u64,
    attestation_nonce: &[u8; 32],
    attestation_timestamp: i64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(constants::ATTESTATION_PREFIX);
    hasher.update(bundle_id.as_bytes());
    hasher.update(payer.as_ref());
    hasher.update(merchant.as_ref());
    hasher.update(amount.to_le_bytes());
    hasher.update(bundle_nonce.to_le_bytes());
    hasher.update([role.as_byte()]);
    hasher.update(attestation_nonce);
    hasher.update(attestation_timestamp.to_le_bytes());
    hasher.finalize().into()
}

/// Length-checked variant for untyped input (e.g. bytes decoded off the wire).
///
/// # Errors
/// Returns `InvalidAttestationInput` if `payer` or `merchant` is not exactly
/// 32 bytes or `attestation_nonce` is not exactly 32 bytes. Nothing is
/// truncated or padded.
#[allow(clippy::too_many_arguments)]
pub fn try_compute_attestation_root(
    role: AttestationRole,
    bundle_id: &str,
    payer: &[u8],
    merchant: &[u8],
    amount: u64,
    bundle_nonce: u64,
    attestation_nonce: &[u8],
    attestation_timestamp: i64,
) -> Result<[u8; 32]> {
    let payer = Pubkey::try_from_slice(payer)?;
    let merchant = Pubkey::try_from_slice(merchant)?;
    let nonce: &[u8; 32] =
        attestation_nonce
            .try_into()
            .map_err(|_| BeamError::InvalidAttestationInput {
                reason: format!(
                    "attestation nonce must be 32 bytes, got {}",
                    attestation_nonce.len()
                ),
            })?;
    Ok(compute_attestation_root(
        role,
        bundle_id,
        &payer,
        &merchant,
        amount,
        bundle_nonce,
        nonce,
        attestation_timestamp,
    ))
}

/// The bundle-side inputs of an attestation root.
#[derive(Debug, Clone, Copy)]
pub struct AttestationContext<'a> {
    pub role: AttestationRole,
    pub bundle_id: &'a str,
    pub payer: &'a Pubkey,
    pub merchant: &'a Pubkey,
    pub amount: u64,
    pub bundle_nonce: u64,
}

impl<'a> AttestationContext<'a> {
    #[must_use]
    pub fn for_bundle(bundle: &'a OfflineBundle, role: AttestationRole) -> Self {
        Self {
            role,
            bundle_id: &bundle.tx_id,
            payer: &bundle.payer,
            merchant: &bundle.merchant,
            amount: bundle.token.amount,
            bundle_nonce: bundle.nonce,
        }
    }

    /// Root for the given attestation nonce and timestamp.
    #[must_use]
    pub fn root(&self, attestation_nonce: &[u8; 32], attestation_timestamp: i64) -> [u8; 32] {
        compute_attestation_root(
            self.role,
            self.bundle_id,
            self.payer,
            self.merchant,
            self.amount,
            self.bundle_nonce,
            attestation_nonce,
            attestation_timestamp,
        )
    }
}
