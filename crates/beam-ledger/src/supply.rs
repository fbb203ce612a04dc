//! Token supply conservation.
//!
//! Invariant checked after every instruction:
//! ```text
//! Σ(wallet balances) + Σ(escrow_balance + stake_locked) == Σ(minted)
//! ```
//!
//! Settlement, funding, withdrawal and slashing only move tokens between
//! wallets and escrow vaults. If the sum ever drifts, the ledger is corrupt.

use beam_types::{BeamError, Result};

/// Tracks total tokens minted into the ledger.
#[derive(Debug, Clone, Default)]
pub struct SupplyConservation {
    minted: u128,
}

impl SupplyConservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mint(&mut self, amount: u64) {
        self.minted += u128::from(amount);
    }

    #[must_use]
    pub fn expected_supply(&self) -> u128 {
        self.minted
    }

    /// Compare the observed supply to the minted total.
    ///
    /// # Errors
    /// Returns [`BeamError::SupplyInvariantViolation`] if they differ.
    pub fn verify(&self, actual_supply: u128) -> Result<()> {
        if actual_supply != self.minted {
            return Err(BeamError::SupplyInvariantViolation {
                reason: format!(
                    "actual supply {actual_supply} != minted {}",
                    self.minted
                ),
            });
        }
        Ok(())
    }
}
