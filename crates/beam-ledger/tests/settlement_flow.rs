//! End-to-end ledger flows: signed bundles, attestation proofs, settlement,
//! replay protection windows and slashing.

use beam_attestation::AttestationIssuer;
use beam_ledger::{EscrowProgram, FraudReport, LedgerEvent, SettleArgs};
use beam_types::*;

const NOW: i64 = 1_700_000_000;
const MINT: Pubkey = Pubkey([0x55; 32]);

struct Harness {
    program: EscrowProgram,
    issuer: AttestationIssuer,
}

fn device() -> DeviceInfo {
    DeviceInfo {
        platform: "android".into(),
        model: "integration".into(),
        security_level: SecurityLevel::StrongBox,
    }
}

impl Harness {
    fn new(payer: &Pubkey) -> Self {
        let issuer = AttestationIssuer::generate();
        let mut program =
            EscrowProgram::new(Pubkey([0x42; 32]), MINT, LedgerConfig::new(issuer.verifier_key()))
                .unwrap();
        program.mint_to(payer, 500_000_000).unwrap();
        program.initialize_escrow(payer, 500_000_000, NOW).unwrap();
        program.initialize_nonce_registry(payer).unwrap();
        Self { program, issuer }
    }

    /// Settle a fully signed and attested bundle.
    fn settle(
        &mut self,
        bundle: &OfflineBundle,
        now: i64,
    ) -> Result<beam_ledger::SettlementReceipt> {
        bundle.verify_signatures()?;
        let payer_env = self.issuer.issue(bundle, AttestationRole::Payer, device(), now);
        let merchant_env = self
            .issuer
            .issue(bundle, AttestationRole::Merchant, device(), now);
        let args = SettleArgs {
            amount: bundle.amount(),
            nonce: bundle.nonce,
            bundle_id: bundle.tx_id.clone(),
            evidence: SettlementEvidence {
                payer_proof: Some(payer_env.to_proof()),
                merchant_proof: Some(merchant_env.to_proof()),
            },
            mode: SettlementMode::Offline,
        };
        self.program
            .settle_offline_payment(&bundle.payer, &bundle.merchant, &args, now)
    }
}

fn signed_bundle(tx_id: &str, amount: u64, nonce: u64) -> OfflineBundle {
    let (mut bundle, payer, merchant) = OfflineBundle::dummy(tx_id, amount, nonce);
    bundle.sign_as_payer(&payer).unwrap();
    bundle.sign_as_merchant(&merchant).unwrap();
    bundle
}

/// Bundles from one payer keypair to one merchant keypair.
fn bundle_series(count: u64, amount: u64) -> Vec<OfflineBundle> {
    let (template, payer, merchant) = OfflineBundle::dummy("series-0", amount, 1);
    (1..=count)
        .map(|n| {
            let mut b = template.clone();
            b.tx_id = format!("series-{n}");
            b.nonce = n;
            b.sign_as_payer(&payer).unwrap();
            b.sign_as_merchant(&merchant).unwrap();
            b
        })
        .collect()
}

#[test]
fn attested_settlement_then_fraud_report() {
    let bundle = signed_bundle("bundle-001", 10_000_000, 1);
    let mut h = Harness::new(&bundle.payer);

    let receipt = h.settle(&bundle, NOW).unwrap();
    assert_eq!(receipt.escrow_balance, 490_000_000);

    let escrow = h.program.escrow(&bundle.payer).unwrap();
    assert_eq!(escrow.last_nonce, 1);
    assert_eq!(h.program.nonce_registry(&bundle.payer).unwrap().bundle_history.len(), 1);
    assert_eq!(h.program.wallet_balance(&bundle.merchant), 10_000_000);

    // A conflicting bundle with the same nonce surfaces; its hash is the evidence.
    let twin = signed_bundle("bundle-001-twin", 10_000_000, 1);
    let report = FraudReport {
        bundle_id: bundle.tx_id.clone(),
        conflicting_hash: twin.hash(),
        reason: FraudReason::DuplicateBundle,
    };
    let slash = h
        .program
        .report_fraudulent_bundle(&bundle.merchant, &bundle.payer, &report, NOW + 10)
        .unwrap();
    assert_eq!(slash.penalty, 20_000_000);
    assert_eq!(slash.escrow_balance, 470_000_000);
    assert_eq!(slash.stake_locked, 20_000_000);
    assert_eq!(slash.reputation_score, -900);
    assert_eq!(slash.fraud_count, 1);

    let err = h
        .program
        .report_fraudulent_bundle(&bundle.merchant, &bundle.payer, &report, NOW + 11)
        .unwrap_err();
    assert!(matches!(err, BeamError::FraudEvidenceExists));

    h.program.verify_supply().unwrap();
    let names: Vec<_> = h.program.events().iter().map(LedgerEvent::name).collect();
    assert!(names.ends_with(&[
        "PaymentSettled",
        "BundleHistoryRecorded",
        "FraudEvidenceSubmitted",
        "FraudPenaltyApplied"
    ]));
}

#[test]
fn replayed_bundle_rejected() {
    let bundle = signed_bundle("bundle-replay", 1_000, 1);
    let mut h = Harness::new(&bundle.payer);
    h.settle(&bundle, NOW).unwrap();

    // Same bundle, same nonce.
    let err = h.settle(&bundle, NOW + 1).unwrap_err();
    assert!(matches!(err, BeamError::InvalidNonce { .. }));
}

#[test]
fn recent_hash_window_is_sixteen() {
    let series = bundle_series(17, 1_000);
    let payer = series[0].payer;
    let mut h = Harness::new(&payer);
    for b in &series {
        h.settle(b, NOW).unwrap();
    }
    let registry = h.program.nonce_registry(&payer).unwrap();
    assert_eq!(registry.recent_bundle_hashes.len(), 16);
    assert!(!registry.recent_bundle_hashes.contains(&series[0].hash()));
    assert!(registry.recent_bundle_hashes.contains(&series[16].hash()));
    assert_eq!(registry.bundle_history.len(), 17);

    // A hash still in the window is a duplicate even with a fresh nonce.
    let mut again = series[10].clone();
    again.nonce = 100;
    let args = SettleArgs {
        amount: again.amount(),
        nonce: again.nonce,
        bundle_id: again.tx_id.clone(),
        evidence: SettlementEvidence::none(),
        mode: SettlementMode::Online,
    };
    let err = h
        .program
        .settle_offline_payment(&payer, &again.merchant, &args, NOW)
        .unwrap_err();
    assert!(matches!(err, BeamError::DuplicateBundle));
}

#[test]
fn history_window_evicts_oldest_for_fraud_lookup() {
    let series = bundle_series(33, 1_000);
    let payer = series[0].payer;
    let merchant = series[0].merchant;
    let mut h = Harness::new(&payer);
    for b in &series {
        h.settle(b, NOW).unwrap();
    }
    assert_eq!(h.program.nonce_registry(&payer).unwrap().bundle_history.len(), 32);

    let report = FraudReport {
        bundle_id: series[0].tx_id.clone(),
        conflicting_hash: [0xAA; 32],
        reason: FraudReason::Other,
    };
    let err = h
        .program
        .report_fraudulent_bundle(&merchant, &payer, &report, NOW)
        .unwrap_err();
    assert!(matches!(err, BeamError::BundleHistoryNotFound));

    let report = FraudReport {
        bundle_id: series[1].tx_id.clone(),
        ..report
    };
    h.program
        .report_fraudulent_bundle(&merchant, &payer, &report, NOW)
        .unwrap();
}

#[test]
fn settlement_arithmetic_is_exact() {
    let series = bundle_series(5, 7_777);
    let payer = series[0].payer;
    let mut h = Harness::new(&payer);
    let mut expected_balance = 500_000_000u64;
    let mut expected_spent = 0u64;
    for b in &series {
        let receipt = h.settle(b, NOW).unwrap();
        expected_balance -= 7_777;
        expected_spent += 7_777;
        assert_eq!(receipt.escrow_balance, expected_balance);
    }
    let escrow = h.program.escrow(&payer).unwrap();
    assert_eq!(escrow.escrow_balance, expected_balance);
    assert_eq!(escrow.total_spent, expected_spent);
    assert_eq!(escrow.last_nonce, 5);
}
