//! Beam device demo.
//!
//! Runs a payer and a merchant device in one process against an in-process
//! escrow ledger:
//!
//! 1. payer creates, signs and attests a bundle (write-ahead logged)
//! 2. payer delivers it to the merchant over an in-memory link
//! 3. merchant counter-signs, stores and acknowledges it
//! 4. merchant settles it on the ledger
//!
//! Configuration comes from the JSON file named by the first argument or
//! `BEAM_CONFIG`; defaults otherwise. Set `RUST_LOG` to adjust verbosity and
//! `BEAM_LOG_FORMAT=json` for JSON logs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use beam_attestation::AttestationIssuer;
use beam_client::telemetry::{LogFormat, init_tracing};
use beam_client::{
    AttestationProvider, BundleTransactionManager, ClientStores, CreateOptions, DeliveryEvent,
    DeliveryPayload, DeliveryService, InProcessLedger, LocalAttestationProvider, MpscChannel,
    SettlementSubmitter, SubmissionOutcome,
};
use beam_ledger::EscrowProgram;
use beam_types::{
    AttestationRole, BeamError, ClientConfig, DeviceInfo, LedgerConfig, OfflineBundle, Pubkey,
    Result, SecurityLevel, TokenInfo,
};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::watch;

const PROGRAM_ID: Pubkey = Pubkey([0x42; 32]);
const MINT: Pubkey = Pubkey([0x55; 32]);
const ESCROW_DEPOSIT: u64 = 100_000_000;
const PAYMENT: u64 = 12_500_000;
const LINK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing("beam_client=info,beam_ledger=info", LogFormat::from_env()) {
        eprintln!("{e}");
    }

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Demo failed");
        std::process::exit(1);
    }
}

fn load_config() -> Result<ClientConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BEAM_CONFIG").ok());
    match path {
        Some(path) => ClientConfig::from_json_file(path),
        None => Ok(ClientConfig::default()),
    }
}

fn device(model: &str) -> DeviceInfo {
    DeviceInfo {
        platform: std::env::consts::OS.to_string(),
        model: model.to_string(),
        security_level: SecurityLevel::Software,
    }
}

async fn open_device(
    config: &ClientConfig,
    name: &str,
    attestor: Arc<dyn AttestationProvider>,
) -> Result<Arc<BundleTransactionManager>> {
    let stores = ClientStores::open(Path::new(&config.data_dir).join(name)).await?;
    let manager = BundleTransactionManager::open(stores, config, Some(attestor)).await?;
    let report = manager.recover().await?;
    tracing::info!(device = name, ?report, "Device ready");
    Ok(Arc::new(manager))
}

async fn run() -> Result<()> {
    let config = load_config()?;

    // Verifier service and ledger.
    let verifier = SigningKey::generate(&mut OsRng);
    let issuer = AttestationIssuer::new(verifier.clone());
    let mut program =
        EscrowProgram::new(PROGRAM_ID, MINT, LedgerConfig::new(issuer.verifier_key()))?;

    let payer_key = SigningKey::generate(&mut OsRng);
    let merchant_key = SigningKey::generate(&mut OsRng);
    let payer = Pubkey(payer_key.verifying_key().to_bytes());
    let merchant = Pubkey(merchant_key.verifying_key().to_bytes());
    let now = Utc::now().timestamp();
    program.mint_to(&payer, ESCROW_DEPOSIT)?;
    let escrow_ref = program.initialize_escrow(&payer, ESCROW_DEPOSIT, now)?;
    program.initialize_nonce_registry(&payer)?;
    let ledger = InProcessLedger::new(program);

    // Devices.
    let payer_device = open_device(
        &config,
        "payer",
        Arc::new(LocalAttestationProvider::new(
            AttestationIssuer::new(verifier.clone()),
            device("payer"),
        )),
    )
    .await?;
    let merchant_device = open_device(
        &config,
        "merchant",
        Arc::new(LocalAttestationProvider::new(
            AttestationIssuer::new(verifier),
            device("merchant"),
        )),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let payer_worker = payer_device.spawn_attestation_worker(shutdown_rx.clone());
    let merchant_worker = merchant_device.spawn_attestation_worker(shutdown_rx.clone());

    // Link: payer ⇄ merchant.
    let (payer_link, mut merchant_inbound) = MpscChannel::pair(16);
    let (merchant_link, payer_inbound) = MpscChannel::pair(16);
    let (mut payer_delivery, mut payer_events) = DeliveryService::new(
        config.delivery.clone(),
        Arc::new(payer_link),
        Arc::clone(&payer_device.stores().state),
    )
    .await?;
    let (mut merchant_delivery, _merchant_events) = DeliveryService::new(
        config.delivery.clone(),
        Arc::new(merchant_link),
        Arc::clone(&merchant_device.stores().state),
    )
    .await?;

    // 1. Payer creates the bundle.
    let tx_id = format!("tx-{}", hex::encode(rand::random::<[u8; 8]>()));
    let mut bundle = OfflineBundle::new(
        &tx_id,
        escrow_ref,
        payer,
        merchant,
        TokenInfo {
            mint: MINT,
            amount: PAYMENT,
            decimals: 6,
        },
        1,
        Utc::now().timestamp(),
    )?;
    bundle.sign_as_payer(&payer_key)?;
    let created = payer_device
        .create_bundle(
            bundle,
            AttestationRole::Payer,
            CreateOptions {
                label: Some("coffee".into()),
                ..CreateOptions::default()
            },
        )
        .await?;

    // 2. Deliver.
    payer_delivery
        .send(&DeliveryPayload::from_transaction(&created)?)
        .await?;
    let payer_loop = tokio::spawn(payer_delivery.run(payer_inbound, shutdown_rx));

    // 3. Merchant receives, counter-signs, stores and acknowledges.
    let frame = tokio::time::timeout(LINK_TIMEOUT, merchant_inbound.recv())
        .await
        .ok()
        .flatten()
        .ok_or_else(|| BeamError::PeerUnavailable {
            reason: "no frame from payer".into(),
        })?;
    let Some(payload) = merchant_delivery.handle_incoming(&frame).await? else {
        return Err(BeamError::Internal("expected a bundle frame".into()));
    };
    let mut received = payload.bundle.clone();
    received.sign_as_merchant(&merchant_key)?;
    merchant_device
        .store_received_bundle(
            received,
            CreateOptions {
                attestations: payload.attestations(),
                ..CreateOptions::default()
            },
        )
        .await?;
    merchant_delivery.acknowledge(&tx_id).await?;

    let delivered = tokio::time::timeout(LINK_TIMEOUT, async {
        while let Some(event) = payer_events.recv().await {
            if matches!(&event, DeliveryEvent::Delivered { bundle_id, .. } if *bundle_id == tx_id) {
                return true;
            }
            tracing::info!(?event, "Payer delivery event");
        }
        false
    })
    .await
    .unwrap_or(false);
    tracing::info!(bundle_id = %tx_id, delivered, "Delivery finished");

    // 4. Merchant settles.
    let submitter =
        SettlementSubmitter::new(Arc::clone(&merchant_device), Arc::new(ledger.clone()));
    match submitter.submit(&tx_id).await? {
        SubmissionOutcome::Settled(receipt) => tracing::info!(
            bundle_id = %tx_id,
            amount = receipt.amount,
            escrow_balance = receipt.escrow_balance,
            merchant_balance = receipt.merchant_balance,
            "Payment settled"
        ),
        SubmissionOutcome::AlreadySettled(record) => tracing::info!(
            bundle_id = %tx_id,
            amount = record.amount,
            "Payment already settled"
        ),
        SubmissionOutcome::Rejected(e) | SubmissionOutcome::Deferred(e) => return Err(e),
    }
    // The payer's copy is no longer needed once the ledger has it.
    payer_device.delete_bundle(&tx_id).await?;

    {
        let program = ledger.program();
        let program = program.lock().await;
        program.verify_supply()?;
        for event in program.events() {
            tracing::info!(event = event.name(), "Ledger event");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in [payer_worker, merchant_worker, payer_loop] {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    Ok(())
}
