//! Settlement submission.
//!
//! Walks a stored bundle `ATTESTED → QUEUED → BROADCAST`, submits it through
//! a [`LedgerGateway`] and settles the local record from the outcome:
//!
//! | Ledger answer | Local result |
//! |---|---|
//! | accepted | `SETTLED`, then deleted |
//! | rejected (`is_ledger_rejection`) | `FAILED`, payload discarded, never retried |
//! | replay rejected, ledger holds this bundle | `SETTLED`, then deleted |
//! | transport error | stays `BROADCAST`, `retry_count` + 1 |
//!
//! A replay rejection (`InvalidNonce`, `DuplicateBundle`) can mean an
//! earlier attempt settled but its answer never arrived, so the ledger's
//! history is consulted before the bundle is failed.

use std::sync::Arc;

use beam_ledger::{FraudReport, SettleArgs, SettlementReceipt, SlashReceipt};
use beam_types::{
    BeamError, BundleRecord, BundleState, BundleTransaction, FraudReason, Pubkey, Result,
    SettlementEvidence, SettlementMode, bundle_hash,
};

use crate::ledger_gateway::{LedgerGateway, SettlementRequest};
use crate::manager::BundleTransactionManager;

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Settled(SettlementReceipt),
    /// An earlier attempt settled; the ledger's record of it.
    AlreadySettled(BundleRecord),
    /// Final ledger rejection.
    Rejected(BeamError),
    /// Not reached the ledger; try again later.
    Deferred(BeamError),
}

pub struct SettlementSubmitter {
    manager: Arc<BundleTransactionManager>,
    gateway: Arc<dyn LedgerGateway>,
    mode: SettlementMode,
}

impl SettlementSubmitter {
    /// Submitter for bundles that were exchanged offline.
    #[must_use]
    pub fn new(manager: Arc<BundleTransactionManager>, gateway: Arc<dyn LedgerGateway>) -> Self {
        Self {
            manager,
            gateway,
            mode: SettlementMode::Offline,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SettlementMode) -> Self {
        self.mode = mode;
        self
    }

    /// Submit one stored bundle.
    ///
    /// # Errors
    /// Local failures only (`TransactionNotFound`, `InvalidStateTransition`,
    /// storage). Ledger and transport outcomes come back as
    /// [`SubmissionOutcome`].
    pub async fn submit(&self, id: &str) -> Result<SubmissionOutcome> {
        let mut txn = self
            .manager
            .get_bundle(id)
            .await?
            .ok_or_else(|| BeamError::TransactionNotFound(id.to_string()))?;

        if txn.state == BundleState::Attested {
            txn = self
                .manager
                .update_bundle_state(id, BundleState::Queued, None)
                .await?;
        }
        if txn.state == BundleState::Queued {
            txn = self
                .manager
                .update_bundle_state(id, BundleState::Broadcast, None)
                .await?;
        }
        if txn.state != BundleState::Broadcast {
            return Err(BeamError::InvalidStateTransition {
                from: txn.state,
                to: BundleState::Broadcast,
            });
        }

        let request = self.request_for(&txn)?;
        match self.gateway.settle(request).await {
            Ok(receipt) => {
                self.manager
                    .update_bundle_state(id, BundleState::Settled, None)
                    .await?;
                self.manager.delete_bundle(id).await?;
                tracing::info!(
                    bundle_id = %id,
                    amount = receipt.amount,
                    nonce = receipt.nonce,
                    "Bundle settled"
                );
                Ok(SubmissionOutcome::Settled(receipt))
            }
            Err(e) if e.is_ledger_rejection() => {
                if matches!(e, BeamError::InvalidNonce { .. } | BeamError::DuplicateBundle) {
                    match self.ledger_record(&txn).await {
                        Ok(Some(record)) => {
                            self.manager
                                .update_bundle_state(id, BundleState::Settled, None)
                                .await?;
                            self.manager.delete_bundle(id).await?;
                            tracing::info!(
                                bundle_id = %id,
                                nonce = record.nonce,
                                settled_at = record.settled_at,
                                "Replay rejected; bundle already settled on the ledger"
                            );
                            return Ok(SubmissionOutcome::AlreadySettled(record));
                        }
                        Ok(None) => {}
                        Err(query) => {
                            let txn = self.manager.record_retry(id, &query).await?;
                            tracing::warn!(
                                bundle_id = %id,
                                retry_count = txn.retry_count,
                                error = %query,
                                "Could not confirm settlement after replay rejection"
                            );
                            return Ok(SubmissionOutcome::Deferred(query));
                        }
                    }
                }
                self.manager
                    .update_bundle_state(id, BundleState::Failed, Some(e.to_string()))
                    .await?;
                self.manager.discard_payload(id).await?;
                tracing::warn!(bundle_id = %id, error = %e, "Settlement rejected by ledger");
                Ok(SubmissionOutcome::Rejected(e))
            }
            Err(e) => {
                let txn = self.manager.record_retry(id, &e).await?;
                tracing::warn!(
                    bundle_id = %id,
                    retry_count = txn.retry_count,
                    error = %e,
                    "Settlement submission deferred"
                );
                Ok(SubmissionOutcome::Deferred(e))
            }
        }
    }

    /// Submit every bundle that is ready, in nonce order so a payer's
    /// bundles reach the ledger in sequence.
    pub async fn submit_ready(&self) -> Result<Vec<(String, SubmissionOutcome)>> {
        let mut ready: Vec<BundleTransaction> = self
            .manager
            .list_bundles()
            .await?
            .into_iter()
            .filter(|t| {
                matches!(
                    t.state,
                    BundleState::Attested | BundleState::Queued | BundleState::Broadcast
                ) && t.bundle.is_some()
            })
            .collect();
        ready.sort_by_key(|t| t.bundle.as_ref().map_or(0, |b| b.nonce));

        let mut outcomes = Vec::with_capacity(ready.len());
        for txn in ready {
            let outcome = self.submit(&txn.id).await?;
            outcomes.push((txn.id, outcome));
        }
        Ok(outcomes)
    }

    /// Report that `payer` signed a second bundle conflicting with the
    /// settled `bundle_id`.
    pub async fn report_conflict(
        &self,
        reporter: Pubkey,
        payer: Pubkey,
        bundle_id: &str,
        conflicting_bundle_id: &str,
    ) -> Result<SlashReceipt> {
        let report = FraudReport {
            bundle_id: bundle_id.to_string(),
            conflicting_hash: bundle_hash(conflicting_bundle_id),
            reason: FraudReason::DuplicateBundle,
        };
        let receipt = self.gateway.report_fraud(reporter, payer, report).await?;
        tracing::warn!(
            bundle_id = %bundle_id,
            payer = %payer.short(),
            penalty = receipt.penalty,
            "Fraud report accepted"
        );
        Ok(receipt)
    }

    /// The ledger's settlement record for this exact bundle: same id,
    /// merchant, amount and nonce.
    async fn ledger_record(&self, txn: &BundleTransaction) -> Result<Option<BundleRecord>> {
        let Some(bundle) = txn.bundle.as_ref() else {
            return Ok(None);
        };
        let record = self
            .gateway
            .settled_bundle(bundle.payer, &bundle.tx_id)
            .await?;
        Ok(record.filter(|r| {
            r.merchant == bundle.merchant && r.amount == bundle.amount() && r.nonce == bundle.nonce
        }))
    }

    fn request_for(&self, txn: &BundleTransaction) -> Result<SettlementRequest> {
        let bundle = txn
            .bundle
            .as_ref()
            .ok_or_else(|| BeamError::Internal(format!("{}: no bundle to settle", txn.id)))?;
        Ok(SettlementRequest {
            payer: bundle.payer,
            merchant: bundle.merchant,
            args: SettleArgs {
                amount: bundle.amount(),
                nonce: bundle.nonce,
                bundle_id: bundle.tx_id.clone(),
                evidence: SettlementEvidence {
                    payer_proof: txn.payer_attestation.as_ref().map(|e| e.to_proof()),
                    merchant_proof: txn.merchant_attestation.as_ref().map(|e| e.to_proof()),
                },
                mode: self.mode,
            },
        })
    }
}
