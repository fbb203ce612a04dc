//! Verifier-side issuance of attestation envelopes.
//!
//! The verifier service checks a device's platform attestation out of band,
//! then signs the attestation root for the requested (bundle, role) pair
//! with its ed25519 key.

use beam_types::{AttestationEnvelope, AttestationRole, DeviceInfo, OfflineBundle};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::root::AttestationContext;

/// Signs attestation roots on behalf of the verifier service.
pub struct AttestationIssuer {
    signing_key: SigningKey,
}

impl AttestationIssuer {
    #[must_use]
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Issuer with a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Public key the ledger trusts.
    #[must_use]
    pub fn verifier_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Issue an envelope with a random attestation nonce.
    #[must_use]
    pub fn issue(
        &self,
        bundle: &OfflineBundle,
        role: AttestationRole,
        device_info: DeviceInfo,
        now: i64,
    ) -> AttestationEnvelope {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        self.issue_with_nonce(bundle, role, device_info, nonce, now)
    }

    /// Issue an envelope for a caller-chosen nonce.
    #[must_use]
    pub fn issue_with_nonce(
        &self,
        bundle: &OfflineBundle,
        role: AttestationRole,
        device_info: DeviceInfo,
        nonce: [u8; 32],
        now: i64,
    ) -> AttestationEnvelope {
        let root = AttestationContext::for_bundle(bundle, role).root(&nonce, now);
        let signature = self.signing_key.sign(&root).to_bytes();

        tracing::debug!(
            bundle_id = %bundle.tx_id,
            role = %role,
            root = hex::encode(root),
            "Attestation issued"
        );

        AttestationEnvelope {
            bundle_id: bundle.tx_id.clone(),
            role,
            timestamp: now,
            nonce,
            attestation_root: root,
            signature,
            attestation_report: Vec::new(),
            certificate_chain: Vec::new(),
            device_info,
        }
    }
}

impl std::fmt::Debug for AttestationIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationIssuer")
            .field("verifier_key", &hex::encode(self.verifier_key()))
            .finish_non_exhaustive()
    }
}
