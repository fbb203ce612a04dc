//! Ledger events, appended to the program's event log after an instruction
//! commits. A failed instruction emits nothing.

use beam_types::{BundleHash, FraudReason, Pubkey, SettlementMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LedgerEvent {
    EscrowInitialized {
        owner: Pubkey,
        escrow: Pubkey,
        initial_amount: u64,
        created_at: i64,
    },
    EscrowFunded {
        owner: Pubkey,
        amount: u64,
        new_balance: u64,
    },
    EscrowWithdrawn {
        owner: Pubkey,
        amount: u64,
        remaining_balance: u64,
    },
    NonceRegistryInitialized {
        payer: Pubkey,
        registry: Pubkey,
    },
    PaymentSettled {
        payer: Pubkey,
        merchant: Pubkey,
        amount: u64,
        nonce: u64,
        bundle_id: String,
        mode: SettlementMode,
        /// Payer proof was present and verified.
        attested: bool,
    },
    BundleHistoryRecorded {
        payer: Pubkey,
        merchant: Pubkey,
        #[serde(with = "beam_types::encoding::b64_array")]
        bundle_hash: BundleHash,
        amount: u64,
        nonce: u64,
        settled_at: i64,
    },
    FraudEvidenceSubmitted {
        payer: Pubkey,
        reporter: Pubkey,
        #[serde(with = "beam_types::encoding::b64_array")]
        bundle_hash: BundleHash,
        #[serde(with = "beam_types::encoding::b64_array")]
        conflicting_hash: BundleHash,
        reason: FraudReason,
        reported_at: i64,
    },
    FraudPenaltyApplied {
        payer: Pubkey,
        penalty: u64,
        remaining_balance: u64,
        stake_locked: u64,
        reputation_score: i32,
        fraud_count: u32,
    },
}

impl LedgerEvent {
    /// Event name as it appears in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::EscrowInitialized { .. } => "EscrowInitialized",
            Self::EscrowFunded { .. } => "EscrowFunded",
            Self::EscrowWithdrawn { .. } => "EscrowWithdrawn",
            Self::NonceRegistryInitialized { .. } => "NonceRegistryInitialized",
            Self::PaymentSettled { .. } => "PaymentSettled",
            Self::BundleHistoryRecorded { .. } => "BundleHistoryRecorded",
            Self::FraudEvidenceSubmitted { .. } => "FraudEvidenceSubmitted",
            Self::FraudPenaltyApplied { .. } => "FraudPenaltyApplied",
        }
    }
}
