//! Attestation service seam.

use async_trait::async_trait;
use beam_attestation::AttestationIssuer;
use beam_types::{AttestationEnvelope, AttestationRole, DeviceInfo, OfflineBundle, Result};
use chrono::Utc;

/// Fetches an attestation envelope for one (bundle, role) pair.
///
/// Implementations talk to the platform key attestation API and the
/// verifier service. Failures should be `AttestationUnavailable`.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    async fn attest(
        &self,
        bundle: &OfflineBundle,
        role: AttestationRole,
    ) -> Result<AttestationEnvelope>;
}

/// Provider backed by an in-process verifier key.
pub struct LocalAttestationProvider {
    issuer: AttestationIssuer,
    device: DeviceInfo,
}

impl LocalAttestationProvider {
    #[must_use]
    pub fn new(issuer: AttestationIssuer, device: DeviceInfo) -> Self {
        Self { issuer, device }
    }
}

#[async_trait]
impl AttestationProvider for LocalAttestationProvider {
    async fn attest(
        &self,
        bundle: &OfflineBundle,
        role: AttestationRole,
    ) -> Result<AttestationEnvelope> {
        Ok(self
            .issuer
            .issue(bundle, role, self.device.clone(), Utc::now().timestamp()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use beam_types::{BeamError, SecurityLevel};
    use ed25519_dalek::SigningKey;

    use super::*;

    pub(crate) fn device() -> DeviceInfo {
        DeviceInfo {
            platform: "android".into(),
            model: "test".into(),
            security_level: SecurityLevel::TrustedEnvironment,
        }
    }

    /// Provider that can be switched offline.
    pub(crate) struct FlakyProvider {
        inner: LocalAttestationProvider,
        pub(crate) online: AtomicBool,
        pub(crate) calls: AtomicUsize,
    }

    impl FlakyProvider {
        pub(crate) fn new(online: bool) -> Self {
            Self {
                inner: LocalAttestationProvider::new(
                    AttestationIssuer::new(SigningKey::from_bytes(&[11u8; 32])),
                    device(),
                ),
                online: AtomicBool::new(online),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AttestationProvider for FlakyProvider {
        async fn attest(
            &self,
            bundle: &OfflineBundle,
            role: AttestationRole,
        ) -> Result<AttestationEnvelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online.load(Ordering::SeqCst) {
                return Err(BeamError::AttestationUnavailable {
                    reason: "verifier unreachable".into(),
                });
            }
            self.inner.attest(bundle, role).await
        }
    }
}
