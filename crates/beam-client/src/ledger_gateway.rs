//! Ledger access seam.
//!
//! From the device's point of view a settlement or fraud report is one
//! indivisible remote call: it fully applies or fully fails.

use std::sync::Arc;

use async_trait::async_trait;
use beam_ledger::{EscrowProgram, FraudReport, SettleArgs, SettlementReceipt, SlashReceipt};
use beam_types::{BundleRecord, Pubkey, Result};
use chrono::Utc;
use tokio::sync::Mutex;

/// A settlement as submitted by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub payer: Pubkey,
    pub merchant: Pubkey,
    pub args: SettleArgs,
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Ledger rejections come back as the ledger's own error
    /// (`BeamError::is_ledger_rejection`); anything else is transport.
    async fn settle(&self, request: SettlementRequest) -> Result<SettlementReceipt>;

    async fn report_fraud(
        &self,
        reporter: Pubkey,
        payer: Pubkey,
        report: FraudReport,
    ) -> Result<SlashReceipt>;

    /// The ledger's record of a settled bundle, if it still has one.
    async fn settled_bundle(&self, payer: Pubkey, bundle_id: &str) -> Result<Option<BundleRecord>>;
}

/// Gateway executing instructions directly against a shared
/// [`EscrowProgram`].
#[derive(Clone)]
pub struct InProcessLedger {
    program: Arc<Mutex<EscrowProgram>>,
}

impl InProcessLedger {
    #[must_use]
    pub fn new(program: EscrowProgram) -> Self {
        Self::shared(Arc::new(Mutex::new(program)))
    }

    #[must_use]
    pub fn shared(program: Arc<Mutex<EscrowProgram>>) -> Self {
        Self { program }
    }

    #[must_use]
    pub fn program(&self) -> Arc<Mutex<EscrowProgram>> {
        Arc::clone(&self.program)
    }
}

#[async_trait]
impl LedgerGateway for InProcessLedger {
    async fn settle(&self, request: SettlementRequest) -> Result<SettlementReceipt> {
        self.program.lock().await.settle_offline_payment(
            &request.payer,
            &request.merchant,
            &request.args,
            Utc::now().timestamp(),
        )
    }

    async fn report_fraud(
        &self,
        reporter: Pubkey,
        payer: Pubkey,
        report: FraudReport,
    ) -> Result<SlashReceipt> {
        self.program.lock().await.report_fraudulent_bundle(
            &reporter,
            &payer,
            &report,
            Utc::now().timestamp(),
        )
    }

    async fn settled_bundle(&self, payer: Pubkey, bundle_id: &str) -> Result<Option<BundleRecord>> {
        Ok(self.program.lock().await.settled_bundle(&payer, bundle_id))
    }
}
