//! # Local bundle transactions
//!
//! Every bundle a device creates or receives gets a [`BundleTransaction`]
//! tracking it through the local state machine:
//!
//! ```text
//!   PENDING ──▶ ATTESTED ──▶ QUEUED ──▶ BROADCAST ──▶ SETTLED
//!      │            │           │           │
//!      └────────────┴─────┬─────┴───────────┘
//!                         ▼
//!                 ROLLBACK ──▶ FAILED
//! ```
//!
//! `SETTLED` and `FAILED` are terminal. Terminal records are eligible for
//! deletion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AttestationEnvelope, AttestationRole, OfflineBundle};

/// Lifecycle state of a local bundle transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleState {
    /// Write-ahead logged; stores may be partially written.
    Pending,
    /// Durably written to every store.
    Attested,
    /// Waiting for a settlement submission slot.
    Queued,
    /// Submitted to the ledger, outcome unknown.
    Broadcast,
    /// Ledger accepted the settlement. **Terminal.**
    Settled,
    /// Unrecoverable failure. **Terminal.**
    Failed,
    /// Partial writes are being undone.
    Rollback,
}

impl BundleState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    /// Can a transaction move from this state to `target`?
    ///
    /// Forward moves go one step at a time; `FAILED` and `ROLLBACK` are
    /// reachable from every non-terminal state.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (Self::Pending, Self::Attested)
                | (Self::Attested, Self::Queued)
                | (Self::Queued, Self::Broadcast)
                | (Self::Broadcast, Self::Settled)
                | (_, Self::Failed)
                | (Self::Pending | Self::Attested | Self::Queued | Self::Broadcast, Self::Rollback)
        )
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Attested => write!(f, "ATTESTED"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Broadcast => write!(f, "BROADCAST"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// Whether the device created the bundle or received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleOrigin {
    /// Created locally (stored in the bundle store).
    Created,
    /// Received from a payer (stored in the receipt store).
    Received,
}

/// Availability of this device's attestation envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttestationStatus {
    /// Envelope stored.
    Attested,
    /// Fetch failed; queued for background retry.
    Pending,
    /// Retries abandoned after the freshness window. Settleable without proof
    /// only where the ledger does not enforce offline attestation.
    TimedOut,
    /// Caller opted out of attestation.
    Skipped,
}

/// Device-local facts about a bundle that do not travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// This device's role in the bundle.
    pub role: AttestationRole,
    pub amount: u64,
    pub created_at: i64,
    /// Free-form label shown to the user.
    pub label: Option<String>,
}

/// Local transaction record for one bundle id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleTransaction {
    pub id: String,
    pub state: BundleState,
    pub origin: BundleOrigin,
    /// Last state change.
    pub timestamp: DateTime<Utc>,
    pub bundle: Option<OfflineBundle>,
    pub metadata: Option<BundleMetadata>,
    pub payer_attestation: Option<AttestationEnvelope>,
    pub merchant_attestation: Option<AttestationEnvelope>,
    pub attestation_status: AttestationStatus,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl BundleTransaction {
    /// New record in `PENDING`.
    #[must_use]
    pub fn pending(id: impl Into<String>, origin: BundleOrigin) -> Self {
        Self {
            id: id.into(),
            state: BundleState::Pending,
            origin,
            timestamp: Utc::now(),
            bundle: None,
            metadata: None,
            payer_attestation: None,
            merchant_attestation: None,
            attestation_status: AttestationStatus::Pending,
            error: None,
            retry_count: 0,
        }
    }

    /// Attestation envelope for a role.
    #[must_use]
    pub fn attestation(&self, role: AttestationRole) -> Option<&AttestationEnvelope> {
        match role {
            AttestationRole::Payer => self.payer_attestation.as_ref(),
            AttestationRole::Merchant => self.merchant_attestation.as_ref(),
        }
    }

    /// Store an attestation envelope under its role.
    pub fn set_attestation(&mut self, envelope: AttestationEnvelope) {
        match envelope.role {
            AttestationRole::Payer => self.payer_attestation = Some(envelope),
            AttestationRole::Merchant => self.merchant_attestation = Some(envelope),
        }
    }
}

/// Operation recorded in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOperation {
    Create,
    Receive,
    Update,
    Delete,
    Rollback,
    Recover,
    Attest,
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Receive => write!(f, "RECEIVE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Recover => write!(f, "RECOVER"),
            Self::Attest => write!(f, "ATTEST"),
        }
    }
}

/// One append-only log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub id: Uuid,
    pub bundle_id: String,
    pub operation: LogOperation,
    pub state: BundleState,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl TransactionLogEntry {
    #[must_use]
    pub fn new(bundle_id: &str, operation: LogOperation, state: BundleState) -> Self {
        Self {
            id: Uuid::now_v7(),
            bundle_id: bundle_id.to_string(),
            operation,
            state,
            timestamp: Utc::now(),
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
