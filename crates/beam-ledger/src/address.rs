//! Derived account addresses.
//!
//! Escrow accounts and nonce registries live at addresses derived from a
//! seed list and the program id. A derived address is deliberately *not* a
//! valid ed25519 public key, so no private key can ever sign for it:
//!
//! ```text
//! for bump in 255..=0:
//!     candidate = SHA-256(seeds... || [bump] || program_id || "ProgramDerivedAddress")
//!     if candidate is not a curve point: return (candidate, bump)
//! ```

use beam_types::{BeamError, Pubkey, Result, constants};
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

/// Search bumps from 255 down for an off-curve address.
///
/// # Errors
/// Returns `Internal` if every bump lands on the curve (probability ≈ 2^-256).
pub fn find_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Result<(Pubkey, u8)> {
    for bump in (0..=u8::MAX).rev() {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update([bump]);
        hasher.update(program_id.as_ref());
        hasher.update(constants::PDA_MARKER);
        let candidate: [u8; 32] = hasher.finalize().into();

        if !is_on_curve(&candidate) {
            return Ok((Pubkey(candidate), bump));
        }
    }
    Err(BeamError::Internal(format!(
        "no off-curve address for program {program_id}"
    )))
}

/// Whether `bytes` decode to an ed25519 point.
#[must_use]
pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
    VerifyingKey::from_bytes(bytes).is_ok()
}

/// Escrow account address for `owner`.
pub fn escrow_address(program_id: &Pubkey, owner: &Pubkey) -> Result<(Pubkey, u8)> {
    find_program_address(&[constants::ESCROW_SEED, owner.as_ref()], program_id)
}

/// Nonce registry address for `payer`.
pub fn nonce_registry_address(program_id: &Pubkey, payer: &Pubkey) -> Result<(Pubkey, u8)> {
    find_program_address(&[constants::NONCE_SEED, payer.as_ref()], program_id)
}
