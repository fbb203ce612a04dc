//! Error types for Beam.
//!
//! All errors use the `BEAM_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Ledger settlement errors
//! - 2xx: Fraud / slashing errors
//! - 3xx: Attestation and bundle integrity errors
//! - 4xx: Local transaction and storage errors
//! - 5xx: Delivery errors
//! - 8xx: Ledger integrity alerts
//! - 9xx: General / internal errors
//!
//! Ledger errors (1xx and 2xx) abort the whole instruction and are a final
//! decision on that submission: they are never retried automatically.

use thiserror::Error;

use crate::BundleState;

/// Central error enum for all Beam operations.
#[derive(Debug, Clone, Error)]
pub enum BeamError {
    // =================================================================
    // Ledger Settlement Errors (1xx)
    // =================================================================
    /// Bundle id is empty or longer than 128 bytes.
    #[error("BEAM_ERR_100: Invalid bundle identifier")]
    InvalidBundleId,

    /// Nonce is not strictly greater than the last settled nonce.
    #[error("BEAM_ERR_101: Invalid nonce {provided} (must be > {last})")]
    InvalidNonce { provided: u64, last: u64 },

    /// Bundle hash is among the recently settled hashes.
    #[error("BEAM_ERR_102: Duplicate bundle detected")]
    DuplicateBundle,

    /// Attestation proof failed verification.
    #[error("BEAM_ERR_103: Invalid attestation provided")]
    InvalidAttestation,

    /// Escrow balance is below the requested amount.
    #[error("BEAM_ERR_104: Insufficient funds in escrow: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    /// Zero or otherwise unusable amount.
    #[error("BEAM_ERR_105: Invalid amount specified")]
    InvalidAmount,

    /// Account owner does not match the signer or the sibling account.
    #[error("BEAM_ERR_106: Invalid owner")]
    InvalidOwner,

    /// Offline settlement without the mandatory payer attestation.
    #[error("BEAM_ERR_107: Attestation required")]
    MissingAttestation,

    /// No account exists at the derived address.
    #[error("BEAM_ERR_108: Account not found: {address}")]
    AccountNotFound { address: String },

    /// Account at the derived address was already created.
    #[error("BEAM_ERR_109: Account already initialized: {address}")]
    AccountAlreadyInitialized { address: String },

    /// Checked addition overflowed.
    #[error("BEAM_ERR_110: Arithmetic overflow")]
    Overflow,

    /// Checked subtraction underflowed.
    #[error("BEAM_ERR_111: Arithmetic underflow")]
    Underflow,

    // =================================================================
    // Fraud / Slashing Errors (2xx)
    // =================================================================
    /// The reported bundle is not in the payer's settlement history.
    #[error("BEAM_ERR_200: Bundle history not found")]
    BundleHistoryNotFound,

    /// Conflicting hash is malformed (all zero).
    #[error("BEAM_ERR_201: Invalid bundle hash")]
    InvalidBundleHash,

    /// Conflicting hash equals the settled bundle hash.
    #[error("BEAM_ERR_202: Conflicting hash matches settled bundle")]
    FraudHashMatches,

    /// Identical evidence was already recorded.
    #[error("BEAM_ERR_203: Fraud evidence already exists")]
    FraudEvidenceExists,

    /// Escrow cannot cover the slash penalty.
    #[error("BEAM_ERR_204: Insufficient funds for slash penalty: need {penalty}, have {available}")]
    InsufficientFundsForSlash { penalty: u64, available: u64 },

    // =================================================================
    // Attestation / Bundle Integrity Errors (3xx)
    // =================================================================
    /// Attestation root inputs have the wrong shape.
    #[error("BEAM_ERR_300: Invalid attestation input: {reason}")]
    InvalidAttestationInput { reason: String },

    /// An ed25519 signature on a bundle did not verify.
    #[error("BEAM_ERR_301: Bundle signature verification failed: {reason}")]
    InvalidSignature { reason: String },

    /// Both signatures are attached; the bundle is immutable.
    #[error("BEAM_ERR_302: Bundle {0} is sealed")]
    BundleSealed(String),

    // =================================================================
    // Local Transaction / Storage Errors (4xx)
    // =================================================================
    /// A live transaction for this bundle id already exists.
    #[error("BEAM_ERR_400: Bundle already exists: {0}")]
    BundleExists(String),

    /// No transaction record for this bundle id.
    #[error("BEAM_ERR_401: Transaction not found: {0}")]
    TransactionNotFound(String),

    /// The requested state change is not allowed.
    #[error("BEAM_ERR_402: Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: BundleState, to: BundleState },

    /// A local store read or write failed.
    #[error("BEAM_ERR_403: Storage error: {reason}")]
    Storage { reason: String },

    /// The attestation service could not produce an envelope.
    #[error("BEAM_ERR_404: Attestation unavailable: {reason}")]
    AttestationUnavailable { reason: String },

    // =================================================================
    // Delivery Errors (5xx)
    // =================================================================
    /// Encoded frame exceeds the transport ceiling.
    #[error("BEAM_ERR_500: Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer channel could not carry the frame.
    #[error("BEAM_ERR_501: Peer unavailable: {reason}")]
    PeerUnavailable { reason: String },

    /// A delivery for this bundle id is already awaiting acknowledgement.
    #[error("BEAM_ERR_502: Delivery already pending: {0}")]
    DeliveryAlreadyPending(String),

    // =================================================================
    // Ledger Integrity (8xx)
    // =================================================================
    /// Token supply is no longer conserved: critical safety alert.
    #[error("BEAM_ERR_800: Supply invariant violation: {reason}")]
    SupplyInvariantViolation { reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("BEAM_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("BEAM_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("BEAM_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (disk, network).
    #[error("BEAM_ERR_903: I/O error: {0}")]
    Io(String),
}

impl BeamError {
    /// Whether this is a ledger decision (settlement or fraud path).
    /// Such rejections are final for the submission.
    #[must_use]
    pub fn is_ledger_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidBundleId
                | Self::InvalidNonce { .. }
                | Self::DuplicateBundle
                | Self::InvalidAttestation
                | Self::InsufficientFunds { .. }
                | Self::InvalidAmount
                | Self::InvalidOwner
                | Self::MissingAttestation
                | Self::AccountNotFound { .. }
                | Self::AccountAlreadyInitialized { .. }
                | Self::Overflow
                | Self::Underflow
                | Self::BundleHistoryNotFound
                | Self::InvalidBundleHash
                | Self::FraudHashMatches
                | Self::FraudEvidenceExists
                | Self::InsufficientFundsForSlash { .. }
        )
    }

    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. }
                | Self::AttestationUnavailable { .. }
                | Self::PeerUnavailable { .. }
                | Self::Io(_)
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, BeamError>;

// Conversion from std::io::Error
impl From<std::io::Error> for BeamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BeamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
