//! System-wide constants for Beam.

/// Domain prefix for the attestation root preimage.
pub const ATTESTATION_PREFIX: &[u8] = b"beam.attestation.v1";

/// Domain prefix for the bundle signing payload.
pub const BUNDLE_SIGNING_PREFIX: &[u8] = b"beam.bundle.v1";

/// Maximum bundle identifier length in bytes.
pub const MAX_BUNDLE_ID_LEN: usize = 128;

/// Maximum age (either direction) of an attestation, in seconds.
pub const MAX_ATTESTATION_AGE_SECS: i64 = 86_400;

/// Recent bundle hashes remembered per payer for duplicate detection.
pub const MAX_RECENT_HASHES: usize = 16;

/// Settled bundles remembered per payer for dispute resolution.
pub const MAX_BUNDLE_HISTORY: usize = 32;

/// Fraud records remembered per payer.
pub const MAX_FRAUD_RECORDS: usize = 16;

/// Initial reputation score for a fresh escrow account.
pub const INITIAL_REPUTATION: i32 = 100;

/// Reputation deducted per proven fraud.
pub const FRAUD_REPUTATION_PENALTY: i32 = 1000;

/// Slash multiplier applied to the fraudulent bundle amount.
pub const SLASH_MULTIPLIER: u64 = 2;

/// Seed prefix of the escrow derived account.
pub const ESCROW_SEED: &[u8] = b"escrow";

/// Seed prefix of the nonce registry derived account.
pub const NONCE_SEED: &[u8] = b"nonce";

/// Marker appended to derived-address preimages.
pub const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

/// Acknowledgement timeout per delivery attempt, in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Consecutive delivery failures before a bundle is queued.
pub const DEFAULT_MAX_DELIVERY_RETRIES: u32 = 3;

/// First delivery backoff step, in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Delivery backoff ceiling, in milliseconds.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 4_000;

/// Durable delivery queue capacity (oldest evicted beyond this).
pub const DEFAULT_DELIVERY_QUEUE_CAPACITY: usize = 64;

/// Interval between delivery queue flushes, in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;

/// Largest encoded delivery frame accepted by the transport.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// First attestation retry delay, in seconds.
pub const DEFAULT_ATTESTATION_RETRY_BASE_SECS: i64 = 30;

/// Attestation retry delay ceiling, in seconds.
pub const DEFAULT_ATTESTATION_RETRY_MAX_SECS: i64 = 3_600;

/// Attestation retries are abandoned this long after the first enqueue.
pub const DEFAULT_ATTESTATION_ABANDON_SECS: i64 = 86_400;

/// Attestation retry queue capacity.
pub const DEFAULT_ATTESTATION_QUEUE_CAPACITY: usize = 256;

/// Transaction log capacity (oldest trimmed).
pub const DEFAULT_LOG_CAPACITY: usize = 1_000;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
