//! Attestation verification.
//!
//! A proof is accepted only if all three hold:
//! 1. the root recomputed from the bundle matches the signed root,
//! 2. `|now - attestation_timestamp| < max_age` (past and future skew both rejected),
//! 3. the verifier signature over the root validates under the verifier key.
//!
//! Every failure collapses to [`BeamError::InvalidAttestation`]; the reason is
//! only logged.

use beam_types::{AttestationEnvelope, AttestationProof, BeamError, Result, constants};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::root::AttestationContext;

/// Checks attestation proofs against a trusted verifier key.
#[derive(Debug, Clone)]
pub struct AttestationVerifier {
    verifier_key: VerifyingKey,
    max_age_secs: i64,
}

impl AttestationVerifier {
    /// Create a verifier for the given verifier-service public key.
    ///
    /// # Errors
    /// Returns `InvalidAttestationInput` if the key is not a valid ed25519 point.
    pub fn new(verifier_key: &[u8; 32]) -> Result<Self> {
        Self::with_max_age(verifier_key, constants::MAX_ATTESTATION_AGE_SECS)
    }

    pub fn with_max_age(verifier_key: &[u8; 32], max_age_secs: i64) -> Result<Self> {
        let verifier_key = VerifyingKey::from_bytes(verifier_key).map_err(|e| {
            BeamError::InvalidAttestationInput {
                reason: format!("verifier key: {e}"),
            }
        })?;
        Ok(Self {
            verifier_key,
            max_age_secs,
        })
    }

    #[must_use]
    pub fn verifier_key(&self) -> [u8; 32] {
        self.verifier_key.to_bytes()
    }

    /// Verify a ledger proof for the given bundle context.
    pub fn verify_proof(
        &self,
        proof: &AttestationProof,
        ctx: &AttestationContext<'_>,
        now: i64,
    ) -> Result<()> {
        self.check(
            ctx,
            &proof.attestation_root,
            &proof.attestation_nonce,
            proof.attestation_timestamp,
            &proof.verifier_signature,
            now,
        )
    }

    /// Verify a full envelope for the given bundle context.
    pub fn verify_envelope(
        &self,
        envelope: &AttestationEnvelope,
        ctx: &AttestationContext<'_>,
        now: i64,
    ) -> Result<()> {
        if envelope.bundle_id != ctx.bundle_id || envelope.role != ctx.role {
            tracing::debug!(
                bundle_id = %ctx.bundle_id,
                envelope_bundle = %envelope.bundle_id,
                "Attestation envelope addressed to another bundle or role"
            );
            return Err(BeamError::InvalidAttestation);
        }
        self.check(
            ctx,
            &envelope.attestation_root,
            &envelope.nonce,
            envelope.timestamp,
            &envelope.signature,
            now,
        )
    }

    fn check(
        &self,
        ctx: &AttestationContext<'_>,
        signed_root: &[u8; 32],
        nonce: &[u8; 32],
        timestamp: i64,
        signature: &[u8; 64],
        now: i64,
    ) -> Result<()> {
        if !self.is_fresh(timestamp, now) {
            tracing::debug!(
                bundle_id = %ctx.bundle_id,
                timestamp,
                now,
                "Attestation outside freshness window"
            );
            return Err(BeamError::InvalidAttestation);
        }

        let expected = ctx.root(nonce, timestamp);
        if &expected != signed_root {
            tracing::debug!(
                bundle_id = %ctx.bundle_id,
                expected = hex::encode(expected),
                signed = hex::encode(signed_root),
                "Attestation root mismatch"
            );
            return Err(BeamError::InvalidAttestation);
        }

        self.verifier_key
            .verify(&expected, &Signature::from_bytes(signature))
            .map_err(|_| {
                tracing::debug!(bundle_id = %ctx.bundle_id, "Verifier signature rejected");
                BeamError::InvalidAttestation
            })
    }

    /// `timestamp > 0` and strictly within `max_age` of `now`.
    #[must_use]
    pub fn is_fresh(&self, timestamp: i64, now: i64) -> bool {
        if timestamp <= 0 {
            return false;
        }
        now.checked_sub(timestamp)
            .and_then(i64::checked_abs)
            .is_some_and(|skew| skew < self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::AttestationIssuer;
    use beam_types::{AttestationRole, DeviceInfo, OfflineBundle, SecurityLevel};
    use ed25519_dalek::SigningKey;

    const NOW: i64 = 1_700_000_000;

    fn device() -> DeviceInfo {
        DeviceInfo {
            platform: "android".into(),
            model: "test".into(),
            security_level: SecurityLevel::TrustedEnvironment,
        }
    }

    fn setup() -> (AttestationIssuer, AttestationVerifier, OfflineBundle) {
        let issuer = AttestationIssuer::new(SigningKey::from_bytes(&[42u8; 32]));
        let verifier = AttestationVerifier::new(&issuer.verifier_key()).unwrap();
        let (bundle, _, _) = OfflineBundle::dummy("verify-1", 10_000_000, 1);
        (issuer, verifier, bundle)
    }

    #[test]
    fn valid_proof_accepted() {
        let (issuer, verifier, bundle) = setup();
        let envelope = issuer.issue(&bundle, AttestationRole::Payer, device(), NOW);
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Payer);
        verifier.verify_proof(&envelope.to_proof(), &ctx, NOW).unwrap();
        verifier.verify_envelope(&envelope, &ctx, NOW + 60).unwrap();
    }

    #[test]
    fn wrong_role_rejected() {
        let (issuer, verifier, bundle) = setup();
        let envelope = issuer.issue(&bundle, AttestationRole::Payer, device(), NOW);
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Merchant);
        let err = verifier.verify_proof(&envelope.to_proof(), &ctx, NOW).unwrap_err();
        assert!(matches!(err, BeamError::InvalidAttestation));
    }

    #[test]
    fn amount_change_rejected() {
        let (issuer, verifier, mut bundle) = setup();
        let envelope = issuer.issue(&bundle, AttestationRole::Payer, device(), NOW);
        bundle.token.amount += 1;
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Payer);
        assert!(verifier.verify_proof(&envelope.to_proof(), &ctx, NOW).is_err());
    }

    #[test]
    fn stale_and_future_rejected() {
        let (issuer, verifier, bundle) = setup();
        let envelope = issuer.issue(&bundle, AttestationRole::Payer, device(), NOW);
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Payer);
        let proof = envelope.to_proof();
        assert!(verifier.verify_proof(&proof, &ctx, NOW + 86_399).is_ok());
        assert!(verifier.verify_proof(&proof, &ctx, NOW + 86_400).is_err());
        assert!(verifier.verify_proof(&proof, &ctx, NOW - 86_400).is_err());
        assert!(verifier.verify_proof(&proof, &ctx, NOW - 86_399).is_ok());
    }

    #[test]
    fn non_positive_timestamp_rejected() {
        let (_, verifier, _) = setup();
        assert!(!verifier.is_fresh(0, 10));
        assert!(!verifier.is_fresh(-5, -5));
        assert!(!verifier.is_fresh(i64::MIN, i64::MAX));
    }

    #[test]
    fn foreign_verifier_signature_rejected() {
        let (_, verifier, bundle) = setup();
        let rogue = AttestationIssuer::new(SigningKey::from_bytes(&[7u8; 32]));
        let envelope = rogue.issue(&bundle, AttestationRole::Payer, device(), NOW);
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Payer);
        let err = verifier.verify_envelope(&envelope, &ctx, NOW).unwrap_err();
        assert!(matches!(err, BeamError::InvalidAttestation));
    }

    #[test]
    fn forged_root_rejected() {
        let (issuer, verifier, bundle) = setup();
        let mut proof = issuer
            .issue(&bundle, AttestationRole::Payer, device(), NOW)
            .to_proof();
        proof.attestation_root[0] ^= 0xff;
        let ctx = AttestationContext::for_bundle(&bundle, AttestationRole::Payer);
        assert!(verifier.verify_proof(&proof, &ctx, NOW).is_err());
    }
}
