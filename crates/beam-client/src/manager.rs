//! # Bundle transaction manager
//!
//! Makes bundle creation and receipt crash-safe across independent local
//! stores. Every mutating operation:
//!
//! 1. takes the per-bundle-id lock,
//! 2. appends its log entry **before** touching any store,
//! 3. writes the stores,
//! 4. advances the transaction record.
//!
//! If a store write fails the partial writes are removed (best effort), a
//! `ROLLBACK` entry is logged and the record ends `FAILED` with the cause.
//! [`BundleTransactionManager::recover`] reconciles records left behind by
//! an abrupt stop.
//!
//! Attestation failures never fail the operation: the bundle is stored
//! without the envelope and a background retry is queued.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use beam_types::{
    AttestationEnvelope, AttestationRole, AttestationStatus, BeamError, BundleMetadata,
    BundleOrigin, BundleState, BundleTransaction, ClientConfig, LogOperation, OfflineBundle,
    Result, TransactionLogEntry, validate_bundle_id,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::attestation::AttestationProvider;
use crate::attestation_queue::{AttestationRetry, AttestationRetryQueue, QUEUE_KEY, RetryOutcome};
use crate::locks::KeyedLocks;
use crate::store::{ClientStores, KeyValueStore, get_json, put_json};
use crate::wal::TransactionLog;

/// State-store key of the transaction id index.
pub const INDEX_KEY: &str = "txn_index";

/// State-store key of one transaction record.
#[must_use]
pub fn record_key(id: &str) -> String {
    format!("txn:{id}")
}

/// Secure-store record: device metadata plus attestation envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureRecord {
    pub metadata: BundleMetadata,
    pub payer_attestation: Option<AttestationEnvelope>,
    pub merchant_attestation: Option<AttestationEnvelope>,
    pub attestation_status: AttestationStatus,
}

/// Options for [`BundleTransactionManager::create_bundle`] and
/// [`BundleTransactionManager::store_received_bundle`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub label: Option<String>,
    /// Envelopes already in hand (e.g. the payer's, delivered with the bundle).
    pub attestations: Vec<AttestationEnvelope>,
    /// Do not fetch this device's attestation.
    pub skip_attestation: bool,
}

/// What [`BundleTransactionManager::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Fully written; advanced to `ATTESTED`.
    pub promoted: Vec<String>,
    /// Nothing written; stale record deleted.
    pub removed: Vec<String>,
    /// Partially written; rolled back to `FAILED`.
    pub rolled_back: Vec<String>,
}

/// What one pass over the attestation retry queue did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationRetryReport {
    pub attested: Vec<String>,
    pub rescheduled: usize,
    /// Marked `TimedOut`.
    pub abandoned: Vec<String>,
    /// Bundle gone or already terminal.
    pub dropped: usize,
}

pub struct BundleTransactionManager {
    stores: ClientStores,
    log: TransactionLog,
    locks: KeyedLocks,
    index: Mutex<BTreeSet<String>>,
    attestor: Option<Arc<dyn AttestationProvider>>,
    retries: Mutex<AttestationRetryQueue>,
    retry_wake: Notify,
}

impl BundleTransactionManager {
    /// Open the manager over `stores`, loading the log, the id index and
    /// the attestation retry queue.
    pub async fn open(
        stores: ClientStores,
        config: &ClientConfig,
        attestor: Option<Arc<dyn AttestationProvider>>,
    ) -> Result<Self> {
        let log = TransactionLog::load(Arc::clone(&stores.state), config.log_capacity).await?;
        let index: BTreeSet<String> = get_json(stores.state.as_ref(), INDEX_KEY)
            .await?
            .unwrap_or_default();
        let queued: Vec<AttestationRetry> = get_json(stores.state.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();
        let retries = AttestationRetryQueue::from_entries(config.attestation_retry.clone(), queued);

        tracing::info!(
            transactions = index.len(),
            log_entries = log.len().await,
            attestation_retries = retries.len(),
            "Bundle transaction manager opened"
        );

        Ok(Self {
            stores,
            log,
            locks: KeyedLocks::new(),
            index: Mutex::new(index),
            attestor,
            retries: Mutex::new(retries),
            retry_wake: Notify::new(),
        })
    }

    // -----------------------------------------------------------------
    // Create / receive
    // -----------------------------------------------------------------

    /// Durably store a bundle this device created.
    ///
    /// # Errors
    /// - `InvalidBundleId` for an empty or over-long id
    /// - `BundleExists` if a live record or stored bundle has this id
    /// - the store error that triggered a rollback
    pub async fn create_bundle(
        &self,
        bundle: OfflineBundle,
        role: AttestationRole,
        options: CreateOptions,
    ) -> Result<BundleTransaction> {
        validate_bundle_id(&bundle.tx_id)?;
        let _guard = self.locks.lock(&bundle.tx_id).await;
        self.ensure_new(&bundle.tx_id, BundleOrigin::Created).await?;
        self.write_new(bundle, role, options, BundleOrigin::Created)
            .await
    }

    /// Durably store a bundle received from a payer. The bundle must carry
    /// a valid payer signature.
    pub async fn store_received_bundle(
        &self,
        bundle: OfflineBundle,
        options: CreateOptions,
    ) -> Result<BundleTransaction> {
        validate_bundle_id(&bundle.tx_id)?;
        if bundle.payer_signature.is_none() {
            return Err(BeamError::InvalidSignature {
                reason: "received bundle has no payer signature".into(),
            });
        }
        bundle.verify_signatures()?;
        let _guard = self.locks.lock(&bundle.tx_id).await;
        self.ensure_new(&bundle.tx_id, BundleOrigin::Received)
            .await?;
        self.write_new(
            bundle,
            AttestationRole::Merchant,
            options,
            BundleOrigin::Received,
        )
        .await
    }

    async fn ensure_new(&self, id: &str, origin: BundleOrigin) -> Result<()> {
        if let Some(existing) = self.load_txn(id).await? {
            if existing.state != BundleState::Failed {
                return Err(BeamError::BundleExists(id.to_string()));
            }
        }
        if self.primary(origin).contains(id).await? {
            return Err(BeamError::BundleExists(id.to_string()));
        }
        Ok(())
    }

    async fn write_new(
        &self,
        bundle: OfflineBundle,
        role: AttestationRole,
        options: CreateOptions,
        origin: BundleOrigin,
    ) -> Result<BundleTransaction> {
        let id = bundle.tx_id.clone();
        let operation = match origin {
            BundleOrigin::Created => LogOperation::Create,
            BundleOrigin::Received => LogOperation::Receive,
        };

        // Write-ahead: log and record before any store is touched.
        self.log
            .append(TransactionLogEntry::new(&id, operation, BundleState::Pending))
            .await?;
        let mut txn = BundleTransaction::pending(&id, origin);
        if let Err(e) = self.save_txn(&txn).await {
            self.rollback(&mut txn, &e).await;
            return Err(e);
        }

        txn.bundle = Some(bundle.clone());
        txn.metadata = Some(BundleMetadata {
            role,
            amount: bundle.amount(),
            created_at: Utc::now().timestamp(),
            label: options.label,
        });
        for envelope in options
            .attestations
            .into_iter()
            .filter(|e| e.bundle_id == id)
        {
            txn.set_attestation(envelope);
        }

        let mut fetch_error = None;
        txn.attestation_status = if options.skip_attestation {
            AttestationStatus::Skipped
        } else if txn.attestation(role).is_some() {
            AttestationStatus::Attested
        } else {
            match self.fetch_attestation(&bundle, role).await {
                Ok(envelope) => {
                    txn.set_attestation(envelope);
                    AttestationStatus::Attested
                }
                Err(e) => {
                    tracing::warn!(
                        bundle_id = %id,
                        role = %role,
                        error = %e,
                        "Attestation unavailable, storing bundle without it"
                    );
                    fetch_error = Some(e.to_string());
                    AttestationStatus::Pending
                }
            }
        };

        if let Err(e) = self.write_stores(&mut txn).await {
            self.rollback(&mut txn, &e).await;
            return Err(e);
        }

        if txn.attestation_status == AttestationStatus::Attested {
            self.log_best_effort(TransactionLogEntry::new(&id, LogOperation::Attest, txn.state))
                .await;
        }
        if let Some(error) = fetch_error {
            self.enqueue_retry(&id, role, error).await;
        }

        tracing::info!(
            bundle_id = %id,
            origin = ?origin,
            amount = bundle.amount(),
            attestation = ?txn.attestation_status,
            "Bundle stored"
        );
        Ok(txn)
    }

    async fn fetch_attestation(
        &self,
        bundle: &OfflineBundle,
        role: AttestationRole,
    ) -> Result<AttestationEnvelope> {
        let attestor = self
            .attestor
            .as_ref()
            .ok_or_else(|| BeamError::AttestationUnavailable {
                reason: "no attestation provider configured".into(),
            })?;
        attestor.attest(bundle, role).await
    }

    /// Primary store, secure store, then `ATTESTED`.
    async fn write_stores(&self, txn: &mut BundleTransaction) -> Result<()> {
        let bundle = txn
            .bundle
            .as_ref()
            .ok_or_else(|| BeamError::Internal(format!("{}: bundle missing", txn.id)))?;
        let metadata = txn
            .metadata
            .clone()
            .ok_or_else(|| BeamError::Internal(format!("{}: metadata missing", txn.id)))?;

        put_json(self.primary(txn.origin), &txn.id, bundle).await?;
        let secure = SecureRecord {
            metadata,
            payer_attestation: txn.payer_attestation.clone(),
            merchant_attestation: txn.merchant_attestation.clone(),
            attestation_status: txn.attestation_status,
        };
        put_json(self.stores.secure.as_ref(), &txn.id, &secure).await?;

        self.log
            .append(TransactionLogEntry::new(
                &txn.id,
                LogOperation::Update,
                BundleState::Attested,
            ))
            .await?;
        txn.state = BundleState::Attested;
        txn.timestamp = Utc::now();
        self.save_txn(txn).await
    }

    /// Best-effort undo of partial writes. Never fails; problems are logged.
    async fn rollback(&self, txn: &mut BundleTransaction, cause: &BeamError) {
        tracing::warn!(bundle_id = %txn.id, error = %cause, "Rolling back bundle transaction");

        txn.state = BundleState::Rollback;
        txn.timestamp = Utc::now();
        if let Err(e) = self.save_txn(txn).await {
            tracing::warn!(bundle_id = %txn.id, error = %e, "Could not record ROLLBACK state");
        }

        for store in [self.primary(txn.origin), self.stores.secure.as_ref()] {
            if let Err(e) = store.remove(&txn.id).await {
                tracing::warn!(
                    bundle_id = %txn.id,
                    store = store.name(),
                    error = %e,
                    "Rollback could not remove partial write"
                );
            }
        }

        self.log_best_effort(
            TransactionLogEntry::new(&txn.id, LogOperation::Rollback, BundleState::Failed)
                .with_error(cause.to_string()),
        )
        .await;

        txn.state = BundleState::Failed;
        txn.error = Some(cause.to_string());
        txn.bundle = None;
        txn.payer_attestation = None;
        txn.merchant_attestation = None;
        txn.timestamp = Utc::now();
        if let Err(e) = self.save_txn(txn).await {
            tracing::warn!(bundle_id = %txn.id, error = %e, "Could not record FAILED state");
        }
    }

    // -----------------------------------------------------------------
    // Update / delete / query
    // -----------------------------------------------------------------

    /// Move a transaction to `target`, recording `error` if given.
    ///
    /// # Errors
    /// - `TransactionNotFound`
    /// - `InvalidStateTransition` if the state machine forbids the move
    pub async fn update_bundle_state(
        &self,
        id: &str,
        target: BundleState,
        error: Option<String>,
    ) -> Result<BundleTransaction> {
        let _guard = self.locks.lock(id).await;
        let mut txn = self.require_txn(id).await?;
        if !txn.state.can_transition_to(target) {
            return Err(BeamError::InvalidStateTransition {
                from: txn.state,
                to: target,
            });
        }

        let mut entry = TransactionLogEntry::new(id, LogOperation::Update, target);
        if let Some(e) = &error {
            entry = entry.with_error(e.clone());
        }
        self.log.append(entry).await?;

        let from = txn.state;
        txn.state = target;
        txn.timestamp = Utc::now();
        if error.is_some() {
            txn.error = error;
        }
        self.save_txn(&txn).await?;
        tracing::debug!(bundle_id = %id, %from, to = %target, "Bundle state updated");
        Ok(txn)
    }

    /// Count a failed submission attempt without changing state.
    pub async fn record_retry(&self, id: &str, error: &BeamError) -> Result<BundleTransaction> {
        let _guard = self.locks.lock(id).await;
        let mut txn = self.require_txn(id).await?;
        self.log
            .append(
                TransactionLogEntry::new(id, LogOperation::Update, txn.state)
                    .with_error(error.to_string()),
            )
            .await?;
        txn.retry_count = txn.retry_count.saturating_add(1);
        txn.error = Some(error.to_string());
        txn.timestamp = Utc::now();
        self.save_txn(&txn).await?;
        Ok(txn)
    }

    /// Remove a bundle, its secure record and its transaction record.
    pub async fn delete_bundle(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let txn = self.require_txn(id).await?;
        self.log
            .append(TransactionLogEntry::new(id, LogOperation::Delete, txn.state))
            .await?;

        self.primary(txn.origin).remove(id).await?;
        self.stores.secure.remove(id).await?;
        self.remove_txn(id).await?;

        let dropped = self.retries.lock().await.remove_bundle(id);
        if dropped > 0 {
            self.persist_retries().await?;
        }
        tracing::info!(bundle_id = %id, state = %txn.state, "Bundle deleted");
        Ok(())
    }

    /// Drop the stored bundle and envelopes of a `FAILED` transaction while
    /// keeping its record. Recovery then never promotes it again.
    pub async fn discard_payload(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let mut txn = self.require_txn(id).await?;
        if txn.state != BundleState::Failed {
            return Err(BeamError::InvalidStateTransition {
                from: txn.state,
                to: BundleState::Failed,
            });
        }
        self.log
            .append(TransactionLogEntry::new(id, LogOperation::Delete, txn.state))
            .await?;
        self.primary(txn.origin).remove(id).await?;
        self.stores.secure.remove(id).await?;
        self.retries.lock().await.remove_bundle(id);
        self.persist_retries().await?;

        txn.bundle = None;
        txn.payer_attestation = None;
        txn.merchant_attestation = None;
        txn.timestamp = Utc::now();
        self.save_txn(&txn).await
    }

    pub async fn get_bundle(&self, id: &str) -> Result<Option<BundleTransaction>> {
        self.load_txn(id).await
    }

    /// All transaction records, ordered by id.
    pub async fn list_bundles(&self) -> Result<Vec<BundleTransaction>> {
        let ids: Vec<String> = self.index.lock().await.iter().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(txn) = self.load_txn(&id).await? {
                out.push(txn);
            }
        }
        Ok(out)
    }

    pub async fn list_by_state(&self, state: BundleState) -> Result<Vec<BundleTransaction>> {
        Ok(self
            .list_bundles()
            .await?
            .into_iter()
            .filter(|t| t.state == state)
            .collect())
    }

    #[must_use]
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    #[must_use]
    pub fn stores(&self) -> &ClientStores {
        &self.stores
    }

    pub async fn pending_attestations(&self) -> Vec<AttestationRetry> {
        self.retries.lock().await.entries()
    }

    // -----------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------

    /// Reconcile records left `PENDING`, `ROLLBACK` or `FAILED` by an
    /// abrupt stop. Run once at startup.
    ///
    /// | primary | secure | action |
    /// |---|---|---|
    /// | yes | yes | promote to `ATTESTED` |
    /// | no | no | delete the stale record |
    /// | otherwise | | roll back |
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let ids: Vec<String> = self.index.lock().await.iter().cloned().collect();
        let mut report = RecoveryReport::default();

        for id in ids {
            let _guard = self.locks.lock(&id).await;
            let Some(mut txn) = self.load_txn(&id).await? else {
                self.remove_txn(&id).await?;
                report.removed.push(id);
                continue;
            };
            if !matches!(
                txn.state,
                BundleState::Pending | BundleState::Rollback | BundleState::Failed
            ) {
                continue;
            }

            let primary = self.primary(txn.origin);
            let in_primary = primary.contains(&id).await?;
            let in_secure = self.stores.secure.contains(&id).await?;

            match (in_primary, in_secure, txn.state) {
                (true, true, BundleState::Pending | BundleState::Failed) => {
                    let bundle: Option<OfflineBundle> = get_json(primary, &id).await?;
                    let secure: Option<SecureRecord> =
                        get_json(self.stores.secure.as_ref(), &id).await?;
                    if let Some(secure) = secure {
                        txn.metadata = Some(secure.metadata);
                        txn.payer_attestation = secure.payer_attestation;
                        txn.merchant_attestation = secure.merchant_attestation;
                        txn.attestation_status = secure.attestation_status;
                    }
                    txn.bundle = bundle;
                    self.log
                        .append(TransactionLogEntry::new(
                            &id,
                            LogOperation::Recover,
                            BundleState::Attested,
                        ))
                        .await?;
                    txn.state = BundleState::Attested;
                    txn.error = None;
                    txn.timestamp = Utc::now();
                    self.save_txn(&txn).await?;
                    report.promoted.push(id);
                }
                (false, false, state) => {
                    self.log
                        .append(
                            TransactionLogEntry::new(&id, LogOperation::Recover, state)
                                .with_error("stale record removed"),
                        )
                        .await?;
                    self.remove_txn(&id).await?;
                    report.removed.push(id);
                }
                _ => {
                    self.log
                        .append(TransactionLogEntry::new(
                            &id,
                            LogOperation::Recover,
                            txn.state,
                        ))
                        .await?;
                    let cause = BeamError::Storage {
                        reason: format!(
                            "partial write detected at startup (primary={in_primary}, secure={in_secure})"
                        ),
                    };
                    self.rollback(&mut txn, &cause).await;
                    report.rolled_back.push(id);
                }
            }
        }

        tracing::info!(
            promoted = report.promoted.len(),
            removed = report.removed.len(),
            rolled_back = report.rolled_back.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------
    // Attestation retries
    // -----------------------------------------------------------------

    async fn enqueue_retry(&self, id: &str, role: AttestationRole, error: String) {
        let evicted = self
            .retries
            .lock()
            .await
            .enqueue(id, role, Utc::now().timestamp(), Some(error));
        if let Some(evicted) = evicted {
            tracing::warn!(
                bundle_id = %evicted.bundle_id,
                "Attestation retry queue full, oldest entry evicted"
            );
        }
        if let Err(e) = self.persist_retries().await {
            tracing::warn!(
                bundle_id = %id,
                error = %e,
                "Could not persist attestation retry queue"
            );
        }
        self.retry_wake.notify_one();
    }

    async fn persist_retries(&self) -> Result<()> {
        let entries = self.retries.lock().await.entries();
        put_json(self.stores.state.as_ref(), QUEUE_KEY, &entries).await
    }

    /// Retry every due attestation fetch once.
    pub async fn process_attestation_retries(&self, now: i64) -> Result<AttestationRetryReport> {
        let due = self.retries.lock().await.due(now);
        let mut report = AttestationRetryReport::default();

        for entry in due {
            let _guard = self.locks.lock(&entry.bundle_id).await;
            let live = self
                .load_txn(&entry.bundle_id)
                .await?
                .filter(|t| !t.state.is_terminal() && t.bundle.is_some());
            let Some(mut txn) = live else {
                self.retries
                    .lock()
                    .await
                    .remove(&entry.bundle_id, entry.role);
                report.dropped += 1;
                continue;
            };

            let expired = self.retries.lock().await.is_expired(&entry, now);
            if expired {
                self.retries
                    .lock()
                    .await
                    .remove(&entry.bundle_id, entry.role);
                self.mark_timed_out(&mut txn, entry.role).await?;
                report.abandoned.push(entry.bundle_id);
                continue;
            }

            let fetched = match txn.bundle.as_ref() {
                Some(bundle) => self.fetch_attestation(bundle, entry.role).await,
                None => continue,
            };
            match fetched {
                Ok(envelope) => {
                    self.attach_attestation(&mut txn, envelope).await?;
                    self.retries
                        .lock()
                        .await
                        .remove(&entry.bundle_id, entry.role);
                    report.attested.push(entry.bundle_id);
                }
                Err(e) => {
                    let outcome = self.retries.lock().await.record_failure(
                        &entry.bundle_id,
                        entry.role,
                        now,
                        e.to_string(),
                    );
                    match outcome {
                        RetryOutcome::Rescheduled { next_attempt_at } => {
                            tracing::debug!(
                                bundle_id = %entry.bundle_id,
                                next_attempt_at,
                                error = %e,
                                "Attestation retry rescheduled"
                            );
                            report.rescheduled += 1;
                        }
                        RetryOutcome::Abandoned => {
                            self.mark_timed_out(&mut txn, entry.role).await?;
                            report.abandoned.push(entry.bundle_id);
                        }
                        RetryOutcome::Untracked => {}
                    }
                }
            }
        }

        self.persist_retries().await?;
        Ok(report)
    }

    async fn attach_attestation(
        &self,
        txn: &mut BundleTransaction,
        envelope: AttestationEnvelope,
    ) -> Result<()> {
        let role = envelope.role;
        txn.set_attestation(envelope);
        txn.attestation_status = AttestationStatus::Attested;

        let metadata = txn
            .metadata
            .clone()
            .ok_or_else(|| BeamError::Internal(format!("{}: metadata missing", txn.id)))?;
        self.log
            .append(TransactionLogEntry::new(&txn.id, LogOperation::Attest, txn.state))
            .await?;
        let secure = SecureRecord {
            metadata,
            payer_attestation: txn.payer_attestation.clone(),
            merchant_attestation: txn.merchant_attestation.clone(),
            attestation_status: txn.attestation_status,
        };
        put_json(self.stores.secure.as_ref(), &txn.id, &secure).await?;
        txn.timestamp = Utc::now();
        self.save_txn(txn).await?;
        tracing::info!(bundle_id = %txn.id, role = %role, "Deferred attestation attached");
        Ok(())
    }

    async fn mark_timed_out(
        &self,
        txn: &mut BundleTransaction,
        role: AttestationRole,
    ) -> Result<()> {
        self.log
            .append(
                TransactionLogEntry::new(&txn.id, LogOperation::Attest, txn.state)
                    .with_error(format!("{role} attestation abandoned")),
            )
            .await?;
        txn.attestation_status = AttestationStatus::TimedOut;
        txn.timestamp = Utc::now();
        if let Some(mut secure) =
            get_json::<SecureRecord>(self.stores.secure.as_ref(), &txn.id).await?
        {
            secure.attestation_status = AttestationStatus::TimedOut;
            put_json(self.stores.secure.as_ref(), &txn.id, &secure).await?;
        }
        self.save_txn(txn).await?;
        tracing::warn!(
            bundle_id = %txn.id,
            role = %role,
            "Attestation retries abandoned; bundle remains settleable without proof"
        );
        Ok(())
    }

    /// Background task that drains the retry queue. Sleeps until the next
    /// entry is due and parks entirely while the queue is empty; enqueueing
    /// wakes it. Exits when `shutdown` changes or its sender is dropped.
    pub fn spawn_attestation_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next_due = manager.retries.lock().await.next_due();
                let Some(due) = next_due else {
                    let stop = tokio::select! {
                        () = manager.retry_wake.notified() => false,
                        _ = shutdown.changed() => true,
                    };
                    if stop {
                        break;
                    }
                    continue;
                };
                let wait = u64::try_from(due - Utc::now().timestamp())
                    .unwrap_or(0)
                    .max(1);
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(wait)) => {
                        let now = Utc::now().timestamp();
                        match manager.process_attestation_retries(now).await {
                            Ok(report) => tracing::debug!(?report, "Attestation retry pass"),
                            Err(e) => tracing::warn!(error = %e, "Attestation retry pass failed"),
                        }
                    }
                    () = manager.retry_wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Attestation retry worker stopped");
        })
    }

    // -----------------------------------------------------------------
    // Record persistence
    // -----------------------------------------------------------------

    fn primary(&self, origin: BundleOrigin) -> &dyn KeyValueStore {
        match origin {
            BundleOrigin::Created => self.stores.bundles.as_ref(),
            BundleOrigin::Received => self.stores.receipts.as_ref(),
        }
    }

    async fn load_txn(&self, id: &str) -> Result<Option<BundleTransaction>> {
        get_json(self.stores.state.as_ref(), &record_key(id)).await
    }

    async fn require_txn(&self, id: &str) -> Result<BundleTransaction> {
        self.load_txn(id)
            .await?
            .ok_or_else(|| BeamError::TransactionNotFound(id.to_string()))
    }

    async fn save_txn(&self, txn: &BundleTransaction) -> Result<()> {
        put_json(self.stores.state.as_ref(), &record_key(&txn.id), txn).await?;
        let mut index = self.index.lock().await;
        if index.insert(txn.id.clone()) {
            if let Err(e) = put_json(self.stores.state.as_ref(), INDEX_KEY, &*index).await {
                index.remove(&txn.id);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn remove_txn(&self, id: &str) -> Result<()> {
        self.stores.state.remove(&record_key(id)).await?;
        let mut index = self.index.lock().await;
        if index.remove(id) {
            put_json(self.stores.state.as_ref(), INDEX_KEY, &*index).await?;
        }
        Ok(())
    }

    async fn log_best_effort(&self, entry: TransactionLogEntry) {
        let bundle_id = entry.bundle_id.clone();
        if let Err(e) = self.log.append(entry).await {
            tracing::warn!(bundle_id = %bundle_id, error = %e, "Transaction log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::attestation::testing::FlakyProvider;
    use crate::store::MemoryStore;
    use crate::store::testing::FaultyStore;

    fn signed(tx_id: &str) -> OfflineBundle {
        let (mut bundle, payer, _) = OfflineBundle::dummy(tx_id, 10_000_000, 1);
        bundle.sign_as_payer(&payer).unwrap();
        bundle
    }

    async fn manager_with(
        stores: ClientStores,
        provider: Option<Arc<FlakyProvider>>,
    ) -> BundleTransactionManager {
        let attestor = provider.map(|p| p as Arc<dyn AttestationProvider>);
        BundleTransactionManager::open(stores, &ClientConfig::default(), attestor)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_writes_every_store() {
        let stores = ClientStores::memory();
        let provider = Arc::new(FlakyProvider::new(true));
        let mgr = manager_with(stores.clone(), Some(provider)).await;

        let txn = mgr
            .create_bundle(signed("tx-1"), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(txn.state, BundleState::Attested);
        assert_eq!(txn.attestation_status, AttestationStatus::Attested);
        assert!(txn.payer_attestation.is_some());

        assert!(stores.bundles.contains("tx-1").await.unwrap());
        assert!(stores.secure.contains("tx-1").await.unwrap());
        let stored = mgr.get_bundle("tx-1").await.unwrap().unwrap();
        assert_eq!(stored.state, BundleState::Attested);

        let ops: Vec<_> = mgr
            .log()
            .for_bundle("tx-1")
            .await
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(
            ops,
            [LogOperation::Create, LogOperation::Update, LogOperation::Attest]
        );
    }

    #[tokio::test]
    async fn failed_store_write_rolls_back_everywhere() {
        let secure = Arc::new(FaultyStore::new("secure"));
        secure.fail_puts(true);
        let stores = ClientStores {
            secure: Arc::clone(&secure) as Arc<dyn KeyValueStore>,
            ..ClientStores::memory()
        };
        let mgr = manager_with(stores.clone(), Some(Arc::new(FlakyProvider::new(true)))).await;

        let err = mgr
            .create_bundle(signed("tx-rb"), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::Storage { .. }));

        assert!(!stores.bundles.contains("tx-rb").await.unwrap());
        assert!(!stores.secure.contains("tx-rb").await.unwrap());
        let txn = mgr.get_bundle("tx-rb").await.unwrap().unwrap();
        assert_eq!(txn.state, BundleState::Failed);
        assert!(txn.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(txn.bundle.is_none());

        let ops: Vec<_> = mgr
            .log()
            .for_bundle("tx-rb")
            .await
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(ops, [LogOperation::Create, LogOperation::Rollback]);
    }

    #[tokio::test]
    async fn failed_create_can_be_retried() {
        let secure = Arc::new(FaultyStore::new("secure"));
        secure.fail_puts(true);
        let stores = ClientStores {
            secure: Arc::clone(&secure) as Arc<dyn KeyValueStore>,
            ..ClientStores::memory()
        };
        let mgr = manager_with(stores, None).await;
        let bundle = signed("tx-again");
        let options = CreateOptions {
            skip_attestation: true,
            ..CreateOptions::default()
        };
        mgr.create_bundle(bundle.clone(), AttestationRole::Payer, options.clone())
            .await
            .unwrap_err();

        secure.fail_puts(false);
        let txn = mgr
            .create_bundle(bundle, AttestationRole::Payer, options)
            .await
            .unwrap();
        assert_eq!(txn.state, BundleState::Attested);
        assert_eq!(txn.attestation_status, AttestationStatus::Skipped);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let mgr = manager_with(ClientStores::memory(), None).await;
        let bundle = signed("tx-dup");
        mgr.create_bundle(bundle.clone(), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap();
        let err = mgr
            .create_bundle(bundle, AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::BundleExists(id) if id == "tx-dup"));
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_id_serialize() {
        let mgr = Arc::new(manager_with(ClientStores::memory(), None).await);
        let bundle = signed("tx-race");
        let a = {
            let mgr = Arc::clone(&mgr);
            let b = bundle.clone();
            tokio::spawn(async move {
                mgr.create_bundle(b, AttestationRole::Payer, CreateOptions::default())
                    .await
            })
        };
        let b = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.create_bundle(bundle, AttestationRole::Payer, CreateOptions::default())
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exists = results
            .iter()
            .filter(|r| matches!(r, Err(BeamError::BundleExists(_))))
            .count();
        assert_eq!((ok, exists), (1, 1));
    }

    #[tokio::test]
    async fn invalid_id_rejected_before_logging() {
        let mgr = manager_with(ClientStores::memory(), None).await;
        let mut bundle = signed("tx");
        bundle.tx_id = String::new();
        let err = mgr
            .create_bundle(bundle, AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::InvalidBundleId));
        assert!(mgr.log().is_empty().await);
    }

    #[tokio::test]
    async fn attestation_outage_degrades_to_retry_queue() {
        let provider = Arc::new(FlakyProvider::new(false));
        let mgr = manager_with(ClientStores::memory(), Some(Arc::clone(&provider))).await;

        let txn = mgr
            .create_bundle(signed("tx-att"), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(txn.state, BundleState::Attested);
        assert_eq!(txn.attestation_status, AttestationStatus::Pending);
        assert!(txn.payer_attestation.is_none());
        let queued = mgr.pending_attestations().await;
        assert_eq!(queued.len(), 1);

        // Not yet due.
        let report = mgr
            .process_attestation_retries(queued[0].next_attempt_at - 1)
            .await
            .unwrap();
        assert_eq!(report, AttestationRetryReport::default());

        // Due, still offline.
        let report = mgr
            .process_attestation_retries(queued[0].next_attempt_at)
            .await
            .unwrap();
        assert_eq!(report.rescheduled, 1);

        // Back online.
        provider.set_online(true);
        let later = mgr.pending_attestations().await[0].next_attempt_at;
        let report = mgr.process_attestation_retries(later).await.unwrap();
        assert_eq!(report.attested, ["tx-att"]);
        assert!(mgr.pending_attestations().await.is_empty());

        let txn = mgr.get_bundle("tx-att").await.unwrap().unwrap();
        assert_eq!(txn.attestation_status, AttestationStatus::Attested);
        assert!(txn.payer_attestation.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attestation_abandoned_after_window() {
        let provider = Arc::new(FlakyProvider::new(false));
        let mgr = manager_with(ClientStores::memory(), Some(provider)).await;
        mgr.create_bundle(signed("tx-old"), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap();
        let first = mgr.pending_attestations().await[0].first_enqueued_at;

        let report = mgr
            .process_attestation_retries(first + 86_400)
            .await
            .unwrap();
        assert_eq!(report.abandoned, ["tx-old"]);
        let txn = mgr.get_bundle("tx-old").await.unwrap().unwrap();
        assert_eq!(txn.attestation_status, AttestationStatus::TimedOut);
        assert_eq!(txn.state, BundleState::Attested);
        assert!(mgr.pending_attestations().await.is_empty());
    }

    #[tokio::test]
    async fn received_bundle_requires_payer_signature() {
        let mgr = manager_with(ClientStores::memory(), None).await;
        let (unsigned, _, _) = OfflineBundle::dummy("tx-unsigned", 5, 1);
        let err = mgr
            .store_received_bundle(unsigned, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::InvalidSignature { .. }));
    }

    #[tokio::test]
    async fn duplicate_receipt_rejected() {
        let stores = ClientStores::memory();
        let mgr = manager_with(stores.clone(), None).await;
        let bundle = signed("tx-recv");
        let txn = mgr
            .store_received_bundle(bundle.clone(), CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(txn.origin, BundleOrigin::Received);
        assert!(stores.receipts.contains("tx-recv").await.unwrap());
        assert!(!stores.bundles.contains("tx-recv").await.unwrap());

        let err = mgr
            .store_received_bundle(bundle, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::BundleExists(_)));
        let receives = mgr
            .log()
            .for_bundle("tx-recv")
            .await
            .iter()
            .filter(|e| e.operation == LogOperation::Receive)
            .count();
        assert_eq!(receives, 1);
    }

    #[tokio::test]
    async fn state_updates_follow_machine() {
        let mgr = manager_with(ClientStores::memory(), None).await;
        mgr.create_bundle(signed("tx-sm"), AttestationRole::Payer, CreateOptions::default())
            .await
            .unwrap();

        let err = mgr
            .update_bundle_state("tx-sm", BundleState::Settled, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BeamError::InvalidStateTransition {
                from: BundleState::Attested,
                to: BundleState::Settled
            }
        ));

        for state in [BundleState::Queued, BundleState::Broadcast, BundleState::Settled] {
            mgr.update_bundle_state("tx-sm", state, None).await.unwrap();
        }
        let err = mgr
            .update_bundle_state("tx-sm", BundleState::Failed, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, BeamError::InvalidStateTransition { .. }));

        mgr.delete_bundle("tx-sm").await.unwrap();
        assert!(mgr.get_bundle("tx-sm").await.unwrap().is_none());
        assert!(mgr.list_bundles().await.unwrap().is_empty());
        let err = mgr.delete_bundle("tx-sm").await.unwrap_err();
        assert!(matches!(err, BeamError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn recovery_promotes_removes_and_rolls_back() {
        let stores = ClientStores::memory();
        let mgr = manager_with(stores.clone(), None).await;

        // Simulate three crashes mid-create by writing records directly.
        let metadata = BundleMetadata {
            role: AttestationRole::Payer,
            amount: 1,
            created_at: 0,
            label: None,
        };
        let secure = SecureRecord {
            metadata,
            payer_attestation: None,
            merchant_attestation: None,
            attestation_status: AttestationStatus::Pending,
        };
        for id in ["tx-full", "tx-none", "tx-half"] {
            mgr.save_txn(&BundleTransaction::pending(id, BundleOrigin::Created))
                .await
                .unwrap();
        }
        put_json(stores.bundles.as_ref(), "tx-full", &signed("tx-full"))
            .await
            .unwrap();
        put_json(stores.secure.as_ref(), "tx-full", &secure)
            .await
            .unwrap();
        put_json(stores.bundles.as_ref(), "tx-half", &signed("tx-half"))
            .await
            .unwrap();

        // Restart.
        drop(mgr);
        let mgr = manager_with(stores.clone(), None).await;
        let report = mgr.recover().await.unwrap();
        assert_eq!(report.promoted, ["tx-full"]);
        assert_eq!(report.removed, ["tx-none"]);
        assert_eq!(report.rolled_back, ["tx-half"]);

        let full = mgr.get_bundle("tx-full").await.unwrap().unwrap();
        assert_eq!(full.state, BundleState::Attested);
        assert!(full.bundle.is_some());
        assert!(mgr.get_bundle("tx-none").await.unwrap().is_none());
        let half = mgr.get_bundle("tx-half").await.unwrap().unwrap();
        assert_eq!(half.state, BundleState::Failed);
        assert!(!stores.bundles.contains("tx-half").await.unwrap());

        // Second pass: the rolled-back record is now fully absent.
        let report = mgr.recover().await.unwrap();
        assert_eq!(report.removed, ["tx-half"]);
        assert!(report.promoted.is_empty());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let state = Arc::new(MemoryStore::new("state"));
        let stores = ClientStores {
            state: Arc::clone(&state) as Arc<dyn KeyValueStore>,
            ..ClientStores::memory()
        };
        let mgr = manager_with(stores.clone(), None).await;
        for id in ["tx-b", "tx-a"] {
            mgr.create_bundle(signed(id), AttestationRole::Payer, CreateOptions::default())
                .await
                .unwrap();
        }
        drop(mgr);
        let reopened = manager_with(stores, None).await;
        let ids: Vec<_> = reopened
            .list_bundles()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, ["tx-a", "tx-b"]);
        assert!(!reopened.log().is_empty().await);
    }
}
