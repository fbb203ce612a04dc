//! # beam-ledger
//!
//! **Escrow ledger**: the on-ledger half of Beam offline payments.
//!
//! ## Architecture
//!
//! [`EscrowProgram`] hosts three kinds of state for a single token mint:
//! - per-owner [`EscrowAccount`](beam_types::EscrowAccount)s at derived addresses
//! - per-payer [`NonceRegistry`](beam_types::NonceRegistry)s (replay protection,
//!   settlement history, fraud records)
//! - plain token wallets
//!
//! Every instruction is atomic: it either commits all of its account
//! changes and events or none of them. After each commit the program checks
//! token [`supply conservation`](SupplyConservation).
//!
//! ## Instructions
//!
//! | Instruction | Effect |
//! |---|---|
//! | `initialize_escrow` | create escrow, move initial funds in |
//! | `fund_escrow` / `withdraw_escrow` | wallet ⇄ escrow |
//! | `initialize_nonce_registry` | create registry |
//! | `settle_offline_payment` | escrow → merchant, after nonce/duplicate/attestation checks |
//! | `report_fraudulent_bundle` | slash 2× the settled amount into `stake_locked` |

pub mod address;
pub mod events;
pub mod program;
pub mod supply;

pub use address::{escrow_address, find_program_address, nonce_registry_address};
pub use events::LedgerEvent;
pub use program::{EscrowProgram, FraudReport, SettleArgs, SettlementReceipt, SlashReceipt};
pub use supply::SupplyConservation;
