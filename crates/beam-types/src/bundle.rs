//! # OfflineBundle: the signed offline transfer
//!
//! A bundle describes a transfer from a payer's escrow to a merchant. The
//! payer signs it first; the merchant counter-signs over the payer's
//! signature. Once both signatures are attached the bundle is **sealed**
//! and can no longer be changed.
//!
//! ```text
//!   ┌──────────┐ payer signs ┌──────────────┐ merchant signs ┌────────┐
//!   │ UNSIGNED ├────────────▶│ PAYER_SIGNED ├───────────────▶│ SEALED │
//!   └──────────┘             └──────────────┘                └────────┘
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{BeamError, BundleHash, Pubkey, Result, bundle_hash, constants, validate_bundle_id};

/// Token being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Token mint address.
    pub mint: Pubkey,
    /// Amount in base units.
    pub amount: u64,
    /// Decimal places of the mint (display only).
    pub decimals: u8,
}

/// A signed, self-contained description of an offline transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineBundle {
    /// Unique bundle id (1–128 bytes).
    pub tx_id: String,
    /// Payer's escrow account address.
    pub escrow_ref: Pubkey,
    /// Payer public key.
    pub payer: Pubkey,
    /// Merchant public key.
    pub merchant: Pubkey,
    /// What is being paid.
    pub token: TokenInfo,
    /// Payer sequence number; must exceed the last settled nonce.
    pub nonce: u64,
    /// Creation time, unix seconds.
    pub timestamp: i64,
    #[serde(default, with = "crate::encoding::b64_array_opt")]
    pub payer_signature: Option<[u8; 64]>,
    #[serde(default, with = "crate::encoding::b64_array_opt")]
    pub merchant_signature: Option<[u8; 64]>,
}

impl OfflineBundle {
    /// Create an unsigned bundle.
    ///
    /// # Errors
    /// Returns `InvalidBundleId` if `tx_id` is empty or longer than 128 bytes.
    pub fn new(
        tx_id: impl Into<String>,
        escrow_ref: Pubkey,
        payer: Pubkey,
        merchant: Pubkey,
        token: TokenInfo,
        nonce: u64,
        timestamp: i64,
    ) -> Result<Self> {
        let tx_id = tx_id.into();
        validate_bundle_id(&tx_id)?;
        Ok(Self {
            tx_id,
            escrow_ref,
            payer,
            merchant,
            token,
            nonce,
            timestamp,
            payer_signature: None,
            merchant_signature: None,
        })
    }

    /// Amount in base units.
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.token.amount
    }

    /// Ledger-side hash of this bundle's id.
    #[must_use]
    pub fn hash(&self) -> BundleHash {
        bundle_hash(&self.tx_id)
    }

    /// Canonical signing payload.
    ///
    /// Format: `"beam.bundle.v1" || tx_id || escrow_ref || payer || merchant || mint || amount || decimals || nonce || timestamp`
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(256);
        payload.extend_from_slice(constants::BUNDLE_SIGNING_PREFIX);
        payload.extend_from_slice(self.tx_id.as_bytes());
        payload.extend_from_slice(self.escrow_ref.as_ref());
        payload.extend_from_slice(self.payer.as_ref());
        payload.extend_from_slice(self.merchant.as_ref());
        payload.extend_from_slice(self.token.mint.as_ref());
        payload.extend_from_slice(&self.token.amount.to_le_bytes());
        payload.push(self.token.decimals);
        payload.extend_from_slice(&self.nonce.to_le_bytes());
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload
    }

    /// Payload the merchant counter-signs: the signing payload followed by
    /// the payer signature.
    fn countersign_payload(&self, payer_signature: &[u8; 64]) -> Vec<u8> {
        let mut payload = self.signing_payload();
        payload.extend_from_slice(payer_signature);
        payload
    }

    /// Both signatures attached.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.payer_signature.is_some() && self.merchant_signature.is_some()
    }

    /// Sign as payer.
    ///
    /// # Errors
    /// - `BundleSealed` if both signatures are already attached
    /// - `InvalidSignature` if `key` is not the bundle's payer key
    pub fn sign_as_payer(&mut self, key: &SigningKey) -> Result<()> {
        if self.is_sealed() {
            return Err(BeamError::BundleSealed(self.tx_id.clone()));
        }
        if key.verifying_key().to_bytes() != self.payer.0 {
            return Err(BeamError::InvalidSignature {
                reason: "signing key is not the payer".into(),
            });
        }
        self.payer_signature = Some(key.sign(&self.signing_payload()).to_bytes());
        Ok(())
    }

    /// Counter-sign as merchant. Requires the payer signature.
    ///
    /// # Errors
    /// - `BundleSealed` if both signatures are already attached
    /// - `InvalidSignature` if the payer has not signed or `key` is not the merchant key
    pub fn sign_as_merchant(&mut self, key: &SigningKey) -> Result<()> {
        if self.is_sealed() {
            return Err(BeamError::BundleSealed(self.tx_id.clone()));
        }
        let payer_sig = self.payer_signature.ok_or_else(|| BeamError::InvalidSignature {
            reason: "payer signature missing".into(),
        })?;
        if key.verifying_key().to_bytes() != self.merchant.0 {
            return Err(BeamError::InvalidSignature {
                reason: "signing key is not the merchant".into(),
            });
        }
        self.merchant_signature = Some(key.sign(&self.countersign_payload(&payer_sig)).to_bytes());
        Ok(())
    }

    /// Verify every attached signature.
    ///
    /// # Errors
    /// Returns `InvalidSignature` naming the first signature that fails.
    pub fn verify_signatures(&self) -> Result<()> {
        if let Some(sig) = &self.payer_signature {
            verify_ed25519(&self.payer, &self.signing_payload(), sig, "payer")?;
        }
        if let Some(sig) = &self.merchant_signature {
            let payer_sig = self.payer_signature.ok_or_else(|| BeamError::InvalidSignature {
                reason: "merchant signature without payer signature".into(),
            })?;
            verify_ed25519(
                &self.merchant,
                &self.countersign_payload(&payer_sig),
                sig,
                "merchant",
            )?;
        }
        Ok(())
    }
}

fn verify_ed25519(key: &Pubkey, message: &[u8], signature: &[u8; 64], who: &str) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|e| BeamError::InvalidSignature {
            reason: format!("{who} key: {e}"),
        })?;
    verifying_key
        .verify(message, &Signature::from_bytes(signature))
        .map_err(|_| BeamError::InvalidSignature {
            reason: format!("{who} signature does not verify"),
        })
}

/// Fixture bundles for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl OfflineBundle {
    /// Unsigned bundle between freshly generated parties.
    ///
    /// Returns the bundle plus the payer and merchant signing keys.
    pub fn dummy(tx_id: &str, amount: u64, nonce: u64) -> (Self, SigningKey, SigningKey) {
        let payer = SigningKey::generate(&mut rand::rngs::OsRng);
        let merchant = SigningKey::generate(&mut rand::rngs::OsRng);
        let bundle = Self {
            tx_id: tx_id.to_string(),
            escrow_ref: Pubkey([0u8; 32]),
            payer: Pubkey(payer.verifying_key().to_bytes()),
            merchant: Pubkey(merchant.verifying_key().to_bytes()),
            token: TokenInfo {
                mint: Pubkey([1u8; 32]),
                amount,
                decimals: 6,
            },
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
            payer_signature: None,
            merchant_signature: None,
        };
        (bundle, payer, merchant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validates_id() {
        let token = TokenInfo {
            mint: Pubkey::default(),
            amount: 1,
            decimals: 6,
        };
        let err = OfflineBundle::new(
            "",
            Pubkey::default(),
            Pubkey::default(),
            Pubkey::default(),
            token,
            1,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BeamError::InvalidBundleId));
    }

    #[test]
    fn payer_then_merchant_seals() {
        let (mut bundle, payer, merchant) = OfflineBundle::dummy("tx-seal", 10_000_000, 1);
        bundle.sign_as_payer(&payer).unwrap();
        assert!(!bundle.is_sealed());
        bundle.sign_as_merchant(&merchant).unwrap();
        assert!(bundle.is_sealed());
        bundle.verify_signatures().unwrap();
    }

    #[test]
    fn sealed_bundle_rejects_new_signatures() {
        let (mut bundle, payer, merchant) = OfflineBundle::dummy("tx-sealed", 5, 1);
        bundle.sign_as_payer(&payer).unwrap();
        bundle.sign_as_merchant(&merchant).unwrap();
        let err = bundle.sign_as_payer(&payer).unwrap_err();
        assert!(matches!(err, BeamError::BundleSealed(id) if id == "tx-sealed"));
    }

    #[test]
    fn merchant_cannot_sign_first() {
        let (mut bundle, _payer, merchant) = OfflineBundle::dummy("tx-order", 5, 1);
        let err = bundle.sign_as_merchant(&merchant).unwrap_err();
        assert!(matches!(err, BeamError::InvalidSignature { .. }));
    }

    #[test]
    fn wrong_key_rejected() {
        let (mut bundle, _payer, merchant) = OfflineBundle::dummy("tx-wrong", 5, 1);
        assert!(bundle.sign_as_payer(&merchant).is_err());
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let (mut bundle, payer, _merchant) = OfflineBundle::dummy("tx-tamper", 5, 1);
        bundle.sign_as_payer(&payer).unwrap();
        bundle.token.amount = 5_000;
        let err = bundle.verify_signatures().unwrap_err();
        assert!(matches!(err, BeamError::InvalidSignature { .. }));
    }

    #[test]
    fn signing_payload_differs_by_nonce() {
        let (b1, _, _) = OfflineBundle::dummy("tx-n", 5, 1);
        let mut b2 = b1.clone();
        b2.nonce = 2;
        assert_ne!(b1.signing_payload(), b2.signing_payload());
    }

    #[test]
    fn serde_keeps_signatures() {
        let (mut bundle, payer, _) = OfflineBundle::dummy("tx-serde", 5, 1);
        bundle.sign_as_payer(&payer).unwrap();
        let json = serde_json::to_string(&bundle).unwrap();
        let back: OfflineBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
        back.verify_signatures().unwrap();
    }
}
