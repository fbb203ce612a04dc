//! # beam-client
//!
//! Device side of **Beam** offline payments.
//!
//! ## Architecture
//!
//! ```text
//!  bundle ──▶ BundleTransactionManager ──▶ DeliveryService ──▶ peer
//!               │  (WAL, per-id locks,        (ack / nack / timeout,
//!               │   rollback, recovery)        durable queue)
//!               │
//!               └──▶ SettlementSubmitter ──▶ LedgerGateway ──▶ EscrowProgram
//! ```
//!
//! | Module | Role |
//! |---|---|
//! | [`store`] | key/value store trait, memory and file backends |
//! | [`wal`] | append-only transaction log |
//! | [`locks`] | per-bundle-id async locks |
//! | [`attestation`] | attestation provider seam |
//! | [`attestation_queue`] | background attestation retry schedule |
//! | [`manager`] | crash-safe bundle transactions and recovery |
//! | [`delivery`] | acknowledgement protocol over a peer channel |
//! | [`ledger_gateway`] | ledger access seam |
//! | [`settlement`] | settlement submission and fraud reports |
//! | [`telemetry`] | tracing subscriber setup |

pub mod attestation;
pub mod attestation_queue;
pub mod delivery;
pub mod ledger_gateway;
pub mod locks;
pub mod manager;
pub mod settlement;
pub mod store;
pub mod telemetry;
pub mod wal;

pub use attestation::{AttestationProvider, LocalAttestationProvider};
pub use attestation_queue::{AttestationRetry, AttestationRetryQueue, RetryOutcome};
pub use delivery::{
    DeliveryEvent, DeliveryFrame, DeliveryPayload, DeliveryService, MpscChannel, NackReason,
    PeerChannel,
};
pub use ledger_gateway::{InProcessLedger, LedgerGateway, SettlementRequest};
pub use locks::{KeyGuard, KeyedLocks};
pub use manager::{
    AttestationRetryReport, BundleTransactionManager, CreateOptions, RecoveryReport, SecureRecord,
};
pub use settlement::{SettlementSubmitter, SubmissionOutcome};
pub use store::{ClientStores, FileStore, KeyValueStore, MemoryStore};
pub use wal::TransactionLog;
