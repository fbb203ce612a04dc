//! Base64 serde adapters for byte fields.
//!
//! Attestation envelopes and signatures travel over constrained peer links
//! and land in the secure store as JSON, so every byte field is encoded as a
//! standard base64 string instead of a JSON number array.
//!
//! ```ignore
//! #[serde(with = "crate::encoding::b64_array")]
//! pub signature: [u8; 64],
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serializer, de};

/// Encode arbitrary bytes as base64.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 string.
pub fn decode(s: &str) -> crate::Result<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| crate::BeamError::Serialization(e.to_string()))
}

/// `Vec<u8>` as base64.
pub mod b64 {
    use super::{Deserialize, Deserializer, STANDARD, Serializer, de};
    use base64::Engine as _;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}

/// `Vec<Vec<u8>>` as a list of base64 strings.
pub mod b64_vec {
    use super::{Deserialize, Deserializer, STANDARD, Serializer, de};
    use base64::Engine as _;
    use serde::Serialize;

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = items.iter().map(|b| STANDARD.encode(b)).collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .iter()
            .map(|s| STANDARD.decode(s).map_err(de::Error::custom))
            .collect()
    }
}

/// Fixed-size byte array as base64, length-checked on decode.
pub mod b64_array {
    use super::{Deserialize, Deserializer, STANDARD, Serializer, de};
    use base64::Engine as _;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = STANDARD.decode(s).map_err(de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom(format!("expected {N} bytes, got {}", bytes.len())))
    }
}

/// Optional fixed-size byte array as base64 (or `null`).
pub mod b64_array_opt {
    use super::{Deserialize, Deserializer, STANDARD, Serializer, de};
    use base64::Engine as _;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &Option<[u8; N]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        let Some(s) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = STANDARD.decode(s).map_err(de::Error::custom)?;
        let arr: [u8; N] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom(format!("expected {N} bytes, got {}", bytes.len())))?;
        Ok(Some(arr))
    }
}
