//! # beam-attestation
//!
//! Binds hardware attestations to bundles.
//!
//! An attestation root is a SHA-256 digest over the bundle fields a party
//! agreed to, that party's role, and a random nonce and timestamp. The
//! verifier service signs the root; the ledger recomputes it from the bundle
//! it is settling and checks the signature and freshness.
//!
//! - [`root`]: deterministic root computation
//! - [`verifier`]: proof verification (root, freshness, signature)
//! - [`issuer`]: verifier-side envelope issuance

pub mod issuer;
pub mod root;
pub mod verifier;

pub use issuer::AttestationIssuer;
pub use root::{AttestationContext, compute_attestation_root, try_compute_attestation_root};
pub use verifier::AttestationVerifier;
