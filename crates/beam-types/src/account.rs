//! Ledger account state.
//!
//! Each payer owns one [`EscrowAccount`] (at the `("escrow", owner)` derived
//! address) and one [`NonceRegistry`] (at `("nonce", payer)`). They are
//! mutated only by settlement and fraud instructions.

use serde::{Deserialize, Serialize};

use crate::{BundleHash, Pubkey, RingBuffer, constants};

/// Per-owner escrow balance and fraud standing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub owner: Pubkey,
    /// Spendable escrow balance in base units.
    pub escrow_balance: u64,
    /// Highest nonce settled from this escrow.
    pub last_nonce: u64,
    /// Lifetime amount settled to merchants.
    pub total_spent: u64,
    /// Starts at 100, minus 1000 per proven fraud. No floor.
    pub reputation_score: i32,
    pub fraud_count: u32,
    pub last_fraud_timestamp: i64,
    /// Slashed funds removed from `escrow_balance`.
    pub stake_locked: u64,
    pub created_at: i64,
    pub bump: u8,
}

impl EscrowAccount {
    /// Fresh account with zero balance.
    #[must_use]
    pub fn new(owner: Pubkey, created_at: i64, bump: u8) -> Self {
        Self {
            owner,
            escrow_balance: 0,
            last_nonce: 0,
            total_spent: 0,
            reputation_score: constants::INITIAL_REPUTATION,
            fraud_count: 0,
            last_fraud_timestamp: 0,
            stake_locked: 0,
            created_at,
            bump,
        }
    }

    /// Tokens held by the escrow vault: spendable plus slashed.
    #[must_use]
    pub fn vault_total(&self) -> u64 {
        self.escrow_balance.saturating_add(self.stake_locked)
    }
}

/// A settled bundle, remembered for dispute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_hash: BundleHash,
    pub merchant: Pubkey,
    pub amount: u64,
    pub settled_at: i64,
    pub nonce: u64,
}

/// Why a fraud report was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FraudReason {
    DuplicateBundle,
    InvalidAttestation,
    #[default]
    Other,
}

/// Accepted fraud evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FraudRecord {
    pub bundle_hash: BundleHash,
    pub conflicting_hash: BundleHash,
    pub reporter: Pubkey,
    pub reported_at: i64,
    pub reason: FraudReason,
}

/// Per-payer replay protection and settlement history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRegistry {
    pub owner: Pubkey,
    pub last_nonce: u64,
    pub recent_bundle_hashes: RingBuffer<BundleHash, { constants::MAX_RECENT_HASHES }>,
    pub bundle_history: RingBuffer<BundleRecord, { constants::MAX_BUNDLE_HISTORY }>,
    pub fraud_records: RingBuffer<FraudRecord, { constants::MAX_FRAUD_RECORDS }>,
    pub bump: u8,
}

impl NonceRegistry {
    #[must_use]
    pub fn new(owner: Pubkey, bump: u8) -> Self {
        Self {
            owner,
            last_nonce: 0,
            recent_bundle_hashes: RingBuffer::new(),
            bundle_history: RingBuffer::new(),
            fraud_records: RingBuffer::new(),
            bump,
        }
    }

    /// Settled bundle with this hash, if still in the history window.
    #[must_use]
    pub fn history_entry(&self, hash: &BundleHash) -> Option<&BundleRecord> {
        self.bundle_history.find(|r| &r.bundle_hash == hash)
    }

    /// Whether this exact evidence pair was already recorded.
    #[must_use]
    pub fn has_fraud_record(&self, hash: &BundleHash, conflicting: &BundleHash) -> bool {
        self.fraud_records
            .any(|r| &r.bundle_hash == hash && &r.conflicting_hash == conflicting)
    }
}
