//! # beam-types
//!
//! Shared types, errors, and configuration for **Beam** offline escrow payments.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`Pubkey`], [`BundleHash`], bundle id validation
//! - **Bundle model**: [`OfflineBundle`], [`TokenInfo`]
//! - **Attestation model**: [`AttestationRole`], [`AttestationEnvelope`], [`AttestationProof`], [`SettlementEvidence`]
//! - **Ledger accounts**: [`EscrowAccount`], [`NonceRegistry`], [`BundleRecord`], [`FraudRecord`]
//! - **Ring buffer**: [`RingBuffer`] with fixed capacity
//! - **Local transactions**: [`BundleTransaction`], [`BundleState`], [`TransactionLogEntry`]
//! - **Configuration**: [`ClientConfig`], [`LedgerConfig`], [`DeliveryConfig`], [`AttestationRetryConfig`]
//! - **Errors**: [`BeamError`] with `BEAM_ERR_` prefix codes
//! - **Constants**: protocol limits and defaults

pub mod account;
pub mod attestation;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod ids;
pub mod ring;
pub mod transaction;

// Re-export all primary types at crate root for ergonomic imports:
//   use beam_types::{OfflineBundle, EscrowAccount, BeamError, ...};

pub use account::*;
pub use attestation::*;
pub use bundle::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use ring::*;
pub use transaction::*;

// Constants are accessed via `beam_types::constants::FOO`
// (not re-exported to avoid name collisions).
