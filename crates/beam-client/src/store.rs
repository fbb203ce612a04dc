//! Local key/value stores.
//!
//! A device keeps several independent stores (bundles, receipts, secure
//! attestation data, transaction state). Writes to different stores are
//! not atomic with respect to each other; the transaction manager's
//! write-ahead log and recovery make up for that.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use beam_types::{BeamError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Asynchronous byte store keyed by string.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store name, for logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns whether the key existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// One file per key under a directory.
///
/// Short keys are stored under the hex encoding of the key. Keys longer than
/// [`MAX_PLAIN_KEY_BYTES`] would overflow the file-name limit, so they go to
/// `k-<sha256 hex>` and the file starts with the key itself (`u32` LE length,
/// then the bytes). Writes go to a temporary file first and are renamed into
/// place.
#[derive(Debug, Clone)]
pub struct FileStore {
    name: String,
    dir: PathBuf,
}

const TMP_SUFFIX: &str = ".tmp";

/// Longest key stored under its plain hex name.
pub const MAX_PLAIN_KEY_BYTES: usize = 100;

const DIGEST_PREFIX: &str = "k-";

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, &e))?;
        Ok(Self {
            name: name.into(),
            dir,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

fn is_digest_key(key: &str) -> bool {
    key.len() > MAX_PLAIN_KEY_BYTES
}

fn file_name_for(key: &str) -> String {
    if is_digest_key(key) {
        format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(key.as_bytes())))
    } else {
        hex::encode(key.as_bytes())
    }
}

fn encode_keyed(key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(key.len()).map_err(|_| BeamError::Storage {
        reason: format!("key of {} bytes is too long", key.len()),
    })?;
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    Ok(out)
}

/// Split a digest-named file into its key and value.
fn decode_keyed(path: &Path, bytes: &[u8]) -> Result<(String, Vec<u8>)> {
    let corrupt = || BeamError::Storage {
        reason: format!("{}: malformed key header", path.display()),
    };
    let (len, rest) = bytes.split_first_chunk::<4>().ok_or_else(corrupt)?;
    let len = usize::try_from(u32::from_le_bytes(*len)).map_err(|_| corrupt())?;
    if rest.len() < len {
        return Err(corrupt());
    }
    let (key, value) = rest.split_at(len);
    let key = String::from_utf8(key.to_vec()).map_err(|_| corrupt())?;
    Ok((key, value.to_vec()))
}

fn storage_error(path: &Path, err: &std::io::Error) -> BeamError {
    BeamError::Storage {
        reason: format!("{}: {err}", path.display()),
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&path, &e)),
        };
        if !is_digest_key(key) {
            return Ok(Some(bytes));
        }
        let (stored, value) = decode_keyed(&path, &bytes)?;
        if stored != key {
            return Err(BeamError::Storage {
                reason: format!("{}: holds a different key", path.display()),
            });
        }
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        let value = if is_digest_key(key) {
            encode_keyed(key, &value)?
        } else {
            value
        };
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| storage_error(&tmp, &e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error(&path, &e))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error(&path, &e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_error(&self.dir, &e))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| storage_error(&self.dir, &e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if name.starts_with(DIGEST_PREFIX) {
                let path = entry.path();
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    // Removed since the listing.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(storage_error(&path, &e)),
                };
                keys.push(decode_keyed(&path, &bytes)?.0);
                continue;
            }
            if let Some(key) = hex::decode(name)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// ClientStores
// ---------------------------------------------------------------------------

/// The four stores a device client uses.
#[derive(Clone)]
pub struct ClientStores {
    /// Bundles this device created, keyed by `tx_id`.
    pub bundles: Arc<dyn KeyValueStore>,
    /// Bundles this device received, keyed by `tx_id`.
    pub receipts: Arc<dyn KeyValueStore>,
    /// Metadata and attestation envelopes, keyed by `tx_id`.
    pub secure: Arc<dyn KeyValueStore>,
    /// Transaction records, id index, log and retry queues.
    pub state: Arc<dyn KeyValueStore>,
}

impl ClientStores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            bundles: Arc::new(MemoryStore::new("bundles")),
            receipts: Arc::new(MemoryStore::new("receipts")),
            secure: Arc::new(MemoryStore::new("secure")),
            state: Arc::new(MemoryStore::new("state")),
        }
    }

    /// File-backed stores in subdirectories of `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let root = data_dir.as_ref();
        Ok(Self {
            bundles: Arc::new(FileStore::open("bundles", root.join("bundles")).await?),
            receipts: Arc::new(FileStore::open("receipts", root.join("receipts")).await?),
            secure: Arc::new(FileStore::open("secure", root.join("secure")).await?),
            state: Arc::new(FileStore::open("state", root.join("state")).await?),
        })
    }
}

/// Store doubles for failure injection.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Wraps a [`MemoryStore`]; `put` fails while `fail_puts` is set.
    #[derive(Debug)]
    pub(crate) struct FaultyStore {
        inner: MemoryStore,
        fail_puts: AtomicBool,
    }

    impl FaultyStore {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                inner: MemoryStore::new(name),
                fail_puts: AtomicBool::new(false),
            }
        }

        pub(crate) fn fail_puts(&self, fail: bool) {
            self.fail_puts.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyValueStore for FaultyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(BeamError::Storage {
                    reason: format!("{}: simulated write failure", self.inner.name()),
                });
            }
            self.inner.put(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
    }
}
