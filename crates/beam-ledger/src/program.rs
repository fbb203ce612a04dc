//! The escrow program.
//!
//! Each public instruction runs as one atomic unit: accounts are copied,
//! every check runs against the copies, and the copies are written back
//! only once nothing can fail. A rejected instruction leaves no trace, not
//! even an event.
//!
//! Settlement checks, in order:
//! 1. bundle id length, amount
//! 2. escrow and registry owners match the payer
//! 3. nonce above **both** `escrow.last_nonce` and `registry.last_nonce`
//! 4. bundle hash not among the recent hashes
//! 5. attestation proofs (payer proof mandatory offline when enforced)
//! 6. balance, checked arithmetic

use std::collections::HashMap;

use beam_attestation::{AttestationContext, AttestationVerifier};
use beam_types::{
    AttestationRole, BeamError, BundleHash, BundleRecord, EscrowAccount, FraudReason, FraudRecord,
    LedgerConfig, NonceRegistry, Pubkey, Result, SettlementEvidence, SettlementMode, bundle_hash,
    constants, validate_bundle_id,
};

use crate::address::{escrow_address, nonce_registry_address};
use crate::events::LedgerEvent;
use crate::supply::SupplyConservation;

/// Arguments of a settlement instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleArgs {
    pub amount: u64,
    pub nonce: u64,
    pub bundle_id: String,
    pub evidence: SettlementEvidence,
    pub mode: SettlementMode,
}

/// Arguments of a fraud report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FraudReport {
    pub bundle_id: String,
    pub conflicting_hash: BundleHash,
    pub reason: FraudReason,
}

/// Outcome of a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub bundle_hash: BundleHash,
    pub amount: u64,
    pub nonce: u64,
    pub escrow_balance: u64,
    pub merchant_balance: u64,
    pub settled_at: i64,
}

/// Outcome of a committed fraud report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashReceipt {
    pub penalty: u64,
    pub escrow_balance: u64,
    pub stake_locked: u64,
    pub reputation_score: i32,
    pub fraud_count: u32,
}

/// In-memory host for escrow accounts, nonce registries and token wallets
/// of a single mint.
pub struct EscrowProgram {
    program_id: Pubkey,
    mint: Pubkey,
    config: LedgerConfig,
    verifier: AttestationVerifier,
    /// Keyed by derived escrow address.
    escrows: HashMap<Pubkey, EscrowAccount>,
    /// Keyed by derived registry address.
    registries: HashMap<Pubkey, NonceRegistry>,
    /// Token balances by owner.
    wallets: HashMap<Pubkey, u64>,
    supply: SupplyConservation,
    events: Vec<LedgerEvent>,
}

impl EscrowProgram {
    /// # Errors
    /// Returns `InvalidAttestationInput` if the configured verifier key is
    /// not a valid ed25519 key.
    pub fn new(program_id: Pubkey, mint: Pubkey, config: LedgerConfig) -> Result<Self> {
        let verifier = AttestationVerifier::with_max_age(
            &config.verifier_key,
            config.max_attestation_age_secs,
        )?;
        Ok(Self {
            program_id,
            mint,
            config,
            verifier,
            escrows: HashMap::new(),
            registries: HashMap::new(),
            wallets: HashMap::new(),
            supply: SupplyConservation::new(),
            events: Vec::new(),
        })
    }

    // -----------------------------------------------------------------
    // Token wallets
    // -----------------------------------------------------------------

    /// Credit freshly minted tokens to `owner`'s wallet.
    pub fn mint_to(&mut self, owner: &Pubkey, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(BeamError::InvalidAmount);
        }
        let balance = self
            .wallet_balance(owner)
            .checked_add(amount)
            .ok_or(BeamError::Overflow)?;
        self.wallets.insert(*owner, balance);
        self.supply.record_mint(amount);
        tracing::debug!(owner = %owner.short(), amount, balance, "Tokens minted");
        Ok(balance)
    }

    #[must_use]
    pub fn wallet_balance(&self, owner: &Pubkey) -> u64 {
        self.wallets.get(owner).copied().unwrap_or(0)
    }

    // -----------------------------------------------------------------
    // Escrow lifecycle
    // -----------------------------------------------------------------

    /// Create `owner`'s escrow account and move `initial_amount` into it.
    ///
    /// # Errors
    /// - `AccountAlreadyInitialized` if the escrow exists
    /// - `InsufficientFunds` if the wallet cannot cover `initial_amount`
    pub fn initialize_escrow(
        &mut self,
        owner: &Pubkey,
        initial_amount: u64,
        now: i64,
    ) -> Result<Pubkey> {
        let (address, bump) = escrow_address(&self.program_id, owner)?;
        if self.escrows.contains_key(&address) {
            return Err(BeamError::AccountAlreadyInitialized {
                address: address.to_string(),
            });
        }

        let wallet = self.wallet_balance(owner);
        let remaining = wallet
            .checked_sub(initial_amount)
            .ok_or(BeamError::InsufficientFunds {
                needed: initial_amount,
                available: wallet,
            })?;
        let mut escrow = EscrowAccount::new(*owner, now, bump);
        escrow.escrow_balance = initial_amount;

        self.wallets.insert(*owner, remaining);
        self.escrows.insert(address, escrow);
        self.events.push(LedgerEvent::EscrowInitialized {
            owner: *owner,
            escrow: address,
            initial_amount,
            created_at: now,
        });
        tracing::info!(
            owner = %owner.short(),
            escrow = %address.short(),
            initial_amount,
            "Escrow initialized"
        );
        self.verify_supply()?;
        Ok(address)
    }

    /// Move `amount` from `owner`'s wallet into their escrow.
    pub fn fund_escrow(&mut self, owner: &Pubkey, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(BeamError::InvalidAmount);
        }
        let (address, _) = escrow_address(&self.program_id, owner)?;
        let mut escrow = self.escrow_at(&address)?.clone();
        if escrow.owner != *owner {
            return Err(BeamError::InvalidOwner);
        }

        let wallet = self.wallet_balance(owner);
        let remaining = wallet
            .checked_sub(amount)
            .ok_or(BeamError::InsufficientFunds {
                needed: amount,
                available: wallet,
            })?;
        escrow.escrow_balance = escrow
            .escrow_balance
            .checked_add(amount)
            .ok_or(BeamError::Overflow)?;
        let new_balance = escrow.escrow_balance;

        self.wallets.insert(*owner, remaining);
        self.escrows.insert(address, escrow);
        self.events.push(LedgerEvent::EscrowFunded {
            owner: *owner,
            amount,
            new_balance,
        });
        tracing::info!(owner = %owner.short(), amount, new_balance, "Escrow funded");
        self.verify_supply()?;
        Ok(new_balance)
    }

    /// Move `amount` from `owner`'s escrow back to their wallet.
    pub fn withdraw_escrow(&mut self, owner: &Pubkey, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(BeamError::InvalidAmount);
        }
        let (address, _) = escrow_address(&self.program_id, owner)?;
        let mut escrow = self.escrow_at(&address)?.clone();
        if escrow.owner != *owner {
            return Err(BeamError::InvalidOwner);
        }
        if escrow.escrow_balance < amount {
            return Err(BeamError::InsufficientFunds {
                needed: amount,
                available: escrow.escrow_balance,
            });
        }
        escrow.escrow_balance = escrow
            .escrow_balance
            .checked_sub(amount)
            .ok_or(BeamError::Underflow)?;
        let wallet = self
            .wallet_balance(owner)
            .checked_add(amount)
            .ok_or(BeamError::Overflow)?;
        let remaining_balance = escrow.escrow_balance;

        self.wallets.insert(*owner, wallet);
        self.escrows.insert(address, escrow);
        self.events.push(LedgerEvent::EscrowWithdrawn {
            owner: *owner,
            amount,
            remaining_balance,
        });
        tracing::info!(owner = %owner.short(), amount, remaining_balance, "Escrow withdrawn");
        self.verify_supply()?;
        Ok(remaining_balance)
    }

    /// Create `payer`'s nonce registry.
    pub fn initialize_nonce_registry(&mut self, payer: &Pubkey) -> Result<Pubkey> {
        let (address, bump) = nonce_registry_address(&self.program_id, payer)?;
        if self.registries.contains_key(&address) {
            return Err(BeamError::AccountAlreadyInitialized {
                address: address.to_string(),
            });
        }
        self.registries
            .insert(address, NonceRegistry::new(*payer, bump));
        self.events.push(LedgerEvent::NonceRegistryInitialized {
            payer: *payer,
            registry: address,
        });
        tracing::info!(
            payer = %payer.short(),
            registry = %address.short(),
            "Nonce registry initialized"
        );
        Ok(address)
    }

    // -----------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------

    /// Settle an offline bundle: move `amount` from the payer's escrow to
    /// the merchant's wallet.
    ///
    /// # Errors
    /// `InvalidBundleId`, `InvalidAmount`, `AccountNotFound`, `InvalidOwner`,
    /// `InvalidNonce`, `DuplicateBundle`, `MissingAttestation`,
    /// `InvalidAttestation`, `InsufficientFunds`, `Overflow`. Any error
    /// leaves every account untouched.
    pub fn settle_offline_payment(
        &mut self,
        payer: &Pubkey,
        merchant: &Pubkey,
        args: &SettleArgs,
        now: i64,
    ) -> Result<SettlementReceipt> {
        validate_bundle_id(&args.bundle_id)?;
        if args.amount == 0 {
            return Err(BeamError::InvalidAmount);
        }

        let (escrow_addr, _) = escrow_address(&self.program_id, payer)?;
        let (registry_addr, _) = nonce_registry_address(&self.program_id, payer)?;
        let mut escrow = self.escrow_at(&escrow_addr)?.clone();
        let mut registry = self.registry_at(&registry_addr)?.clone();
        check_owners(payer, &escrow, &registry)?;

        if args.nonce <= escrow.last_nonce {
            return Err(BeamError::InvalidNonce {
                provided: args.nonce,
                last: escrow.last_nonce,
            });
        }
        if args.nonce <= registry.last_nonce {
            return Err(BeamError::InvalidNonce {
                provided: args.nonce,
                last: registry.last_nonce,
            });
        }

        let hash = bundle_hash(&args.bundle_id);
        if registry.recent_bundle_hashes.contains(&hash) {
            tracing::warn!(
                bundle_id = %args.bundle_id,
                payer = %payer.short(),
                "Duplicate bundle rejected"
            );
            return Err(BeamError::DuplicateBundle);
        }

        let attested = self.check_evidence(payer, merchant, args, now)?;

        escrow.escrow_balance =
            escrow
                .escrow_balance
                .checked_sub(args.amount)
                .ok_or(BeamError::InsufficientFunds {
                    needed: args.amount,
                    available: escrow.escrow_balance,
                })?;
        escrow.total_spent = escrow
            .total_spent
            .checked_add(args.amount)
            .ok_or(BeamError::Overflow)?;
        let merchant_balance = self
            .wallet_balance(merchant)
            .checked_add(args.amount)
            .ok_or(BeamError::Overflow)?;
        escrow.last_nonce = args.nonce;
        registry.last_nonce = args.nonce;
        registry.recent_bundle_hashes.push(hash);
        registry.bundle_history.push(BundleRecord {
            bundle_hash: hash,
            merchant: *merchant,
            amount: args.amount,
            settled_at: now,
            nonce: args.nonce,
        });

        let receipt = SettlementReceipt {
            bundle_hash: hash,
            amount: args.amount,
            nonce: args.nonce,
            escrow_balance: escrow.escrow_balance,
            merchant_balance,
            settled_at: now,
        };

        // Commit.
        self.escrows.insert(escrow_addr, escrow);
        self.registries.insert(registry_addr, registry);
        self.wallets.insert(*merchant, merchant_balance);
        self.events.push(LedgerEvent::PaymentSettled {
            payer: *payer,
            merchant: *merchant,
            amount: args.amount,
            nonce: args.nonce,
            bundle_id: args.bundle_id.clone(),
            mode: args.mode,
            attested,
        });
        self.events.push(LedgerEvent::BundleHistoryRecorded {
            payer: *payer,
            merchant: *merchant,
            bundle_hash: hash,
            amount: args.amount,
            nonce: args.nonce,
            settled_at: now,
        });

        tracing::info!(
            bundle_id = %args.bundle_id,
            payer = %payer.short(),
            merchant = %merchant.short(),
            amount = args.amount,
            nonce = args.nonce,
            attested,
            escrow_balance = receipt.escrow_balance,
            "Offline payment settled"
        );
        self.verify_supply()?;
        Ok(receipt)
    }

    /// Returns whether a payer proof was verified.
    fn check_evidence(
        &self,
        payer: &Pubkey,
        merchant: &Pubkey,
        args: &SettleArgs,
        now: i64,
    ) -> Result<bool> {
        let evidence = &args.evidence;
        if args.mode == SettlementMode::Offline
            && self.config.enforce_offline_attestation
            && evidence.payer_proof.is_none()
        {
            return Err(BeamError::MissingAttestation);
        }
        if let Some(proof) = &evidence.payer_proof {
            let ctx = settlement_context(args, payer, merchant, AttestationRole::Payer);
            self.verifier.verify_proof(proof, &ctx, now)?;
        }
        if let Some(proof) = &evidence.merchant_proof {
            let ctx = settlement_context(args, payer, merchant, AttestationRole::Merchant);
            self.verifier.verify_proof(proof, &ctx, now)?;
        }
        Ok(evidence.payer_proof.is_some())
    }

    // -----------------------------------------------------------------
    // Fraud
    // -----------------------------------------------------------------

    /// Slash `payer` for a settled bundle that has a conflicting twin.
    ///
    /// Penalty is twice the settled amount, moved from `escrow_balance` to
    /// `stake_locked`. Identical evidence is accepted once.
    pub fn report_fraudulent_bundle(
        &mut self,
        reporter: &Pubkey,
        payer: &Pubkey,
        report: &FraudReport,
        now: i64,
    ) -> Result<SlashReceipt> {
        validate_bundle_id(&report.bundle_id)?;

        let (escrow_addr, _) = escrow_address(&self.program_id, payer)?;
        let (registry_addr, _) = nonce_registry_address(&self.program_id, payer)?;
        let mut escrow = self.escrow_at(&escrow_addr)?.clone();
        let mut registry = self.registry_at(&registry_addr)?.clone();
        check_owners(payer, &escrow, &registry)?;

        let hash = bundle_hash(&report.bundle_id);
        let record = *registry
            .history_entry(&hash)
            .ok_or(BeamError::BundleHistoryNotFound)?;
        if report.conflicting_hash == [0u8; 32] {
            return Err(BeamError::InvalidBundleHash);
        }
        if report.conflicting_hash == hash {
            return Err(BeamError::FraudHashMatches);
        }
        if registry.has_fraud_record(&hash, &report.conflicting_hash) {
            return Err(BeamError::FraudEvidenceExists);
        }

        let penalty = record
            .amount
            .checked_mul(constants::SLASH_MULTIPLIER)
            .ok_or(BeamError::Overflow)?;
        if escrow.escrow_balance < penalty {
            return Err(BeamError::InsufficientFundsForSlash {
                penalty,
                available: escrow.escrow_balance,
            });
        }

        escrow.escrow_balance = escrow
            .escrow_balance
            .checked_sub(penalty)
            .ok_or(BeamError::Underflow)?;
        escrow.stake_locked = escrow
            .stake_locked
            .checked_add(penalty)
            .ok_or(BeamError::Overflow)?;
        escrow.fraud_count = escrow
            .fraud_count
            .checked_add(1)
            .ok_or(BeamError::Overflow)?;
        escrow.reputation_score = escrow
            .reputation_score
            .checked_sub(constants::FRAUD_REPUTATION_PENALTY)
            .ok_or(BeamError::Overflow)?;
        escrow.last_fraud_timestamp = now;
        registry.fraud_records.push(FraudRecord {
            bundle_hash: hash,
            conflicting_hash: report.conflicting_hash,
            reporter: *reporter,
            reported_at: now,
            reason: report.reason,
        });

        let receipt = SlashReceipt {
            penalty,
            escrow_balance: escrow.escrow_balance,
            stake_locked: escrow.stake_locked,
            reputation_score: escrow.reputation_score,
            fraud_count: escrow.fraud_count,
        };

        // Commit.
        self.escrows.insert(escrow_addr, escrow);
        self.registries.insert(registry_addr, registry);
        self.events.push(LedgerEvent::FraudEvidenceSubmitted {
            payer: *payer,
            reporter: *reporter,
            bundle_hash: hash,
            conflicting_hash: report.conflicting_hash,
            reason: report.reason,
            reported_at: now,
        });
        self.events.push(LedgerEvent::FraudPenaltyApplied {
            payer: *payer,
            penalty,
            remaining_balance: receipt.escrow_balance,
            stake_locked: receipt.stake_locked,
            reputation_score: receipt.reputation_score,
            fraud_count: receipt.fraud_count,
        });

        tracing::warn!(
            bundle_id = %report.bundle_id,
            payer = %payer.short(),
            reporter = %reporter.short(),
            penalty,
            reputation = receipt.reputation_score,
            fraud_count = receipt.fraud_count,
            "Fraud penalty applied"
        );
        self.verify_supply()?;
        Ok(receipt)
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    #[must_use]
    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    #[must_use]
    pub fn mint(&self) -> &Pubkey {
        &self.mint
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Escrow account owned by `owner`.
    #[must_use]
    pub fn escrow(&self, owner: &Pubkey) -> Option<&EscrowAccount> {
        let (address, _) = escrow_address(&self.program_id, owner).ok()?;
        self.escrows.get(&address)
    }

    /// Nonce registry of `payer`.
    #[must_use]
    pub fn nonce_registry(&self, payer: &Pubkey) -> Option<&NonceRegistry> {
        let (address, _) = nonce_registry_address(&self.program_id, payer).ok()?;
        self.registries.get(&address)
    }

    /// Settlement record of `bundle_id` for `payer`, while it is still in
    /// the payer's history window.
    #[must_use]
    pub fn settled_bundle(&self, payer: &Pubkey, bundle_id: &str) -> Option<BundleRecord> {
        let hash = bundle_hash(bundle_id);
        self.nonce_registry(payer)?.history_entry(&hash).copied()
    }

    /// Events emitted so far, oldest first.
    #[must_use]
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Take the event log.
    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Tokens held in wallets and escrow vaults.
    #[must_use]
    pub fn circulating_supply(&self) -> u128 {
        let wallets: u128 = self.wallets.values().map(|b| u128::from(*b)).sum();
        let vaults: u128 = self
            .escrows
            .values()
            .map(|e| u128::from(e.escrow_balance) + u128::from(e.stake_locked))
            .sum();
        wallets + vaults
    }

    /// Check supply conservation.
    ///
    /// # Errors
    /// Returns `SupplyInvariantViolation` if tokens appeared or vanished.
    pub fn verify_supply(&self) -> Result<()> {
        self.supply
            .verify(self.circulating_supply())
            .inspect_err(|e| tracing::error!(error = %e, "Ledger supply invariant broken"))
    }

    fn escrow_at(&self, address: &Pubkey) -> Result<&EscrowAccount> {
        self.escrows
            .get(address)
            .ok_or_else(|| BeamError::AccountNotFound {
                address: address.to_string(),
            })
    }

    fn registry_at(&self, address: &Pubkey) -> Result<&NonceRegistry> {
        self.registries
            .get(address)
            .ok_or_else(|| BeamError::AccountNotFound {
                address: address.to_string(),
            })
    }
}

/// Registry, escrow and payer must all agree on the owner.
fn check_owners(payer: &Pubkey, escrow: &EscrowAccount, registry: &NonceRegistry) -> Result<()> {
    if escrow.owner != *payer || registry.owner != *payer {
        return Err(BeamError::InvalidOwner);
    }
    Ok(())
}

fn settlement_context<'a>(
    args: &'a SettleArgs,
    payer: &'a Pubkey,
    merchant: &'a Pubkey,
    role: AttestationRole,
) -> AttestationContext<'a> {
    AttestationContext {
        role,
        bundle_id: &args.bundle_id,
        payer,
        merchant,
        amount: args.amount,
        bundle_nonce: args.nonce,
    }
}
