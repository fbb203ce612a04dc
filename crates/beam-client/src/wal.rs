//! Append-only transaction log.
//!
//! Every state-changing operation writes its log entry *before* touching
//! any store. The log is capped; the oldest entries are trimmed first.

use std::collections::VecDeque;
use std::sync::Arc;

use beam_types::{Result, TransactionLogEntry};
use tokio::sync::Mutex;

use crate::store::{KeyValueStore, get_json, put_json};

/// State-store key holding the serialized log.
pub const LOG_KEY: &str = "txn_log";

pub struct TransactionLog {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
    entries: Mutex<VecDeque<TransactionLogEntry>>,
}

impl TransactionLog {
    /// Load the persisted log, trimming it to `capacity`.
    pub async fn load(store: Arc<dyn KeyValueStore>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut entries: VecDeque<TransactionLogEntry> =
            get_json::<Vec<TransactionLogEntry>>(store.as_ref(), LOG_KEY)
                .await?
                .unwrap_or_default()
                .into();
        while entries.len() > capacity {
            entries.pop_front();
        }
        Ok(Self {
            store,
            capacity,
            entries: Mutex::new(entries),
        })
    }

    /// Append and persist. The entry stays in memory even if persisting fails.
    pub async fn append(&self, entry: TransactionLogEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        tracing::debug!(
            bundle_id = %entry.bundle_id,
            operation = %entry.operation,
            state = %entry.state,
            "Transaction log append"
        );
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        put_json(self.store.as_ref(), LOG_KEY, &*entries).await
    }

    /// Snapshot, oldest first.
    pub async fn entries(&self) -> Vec<TransactionLogEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn for_bundle(&self, bundle_id: &str) -> Vec<TransactionLogEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.bundle_id == bundle_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use beam_types::{BundleState, LogOperation};

    #[tokio::test]
    async fn append_trims_oldest() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("state"));
        let log = TransactionLog::load(Arc::clone(&store), 3).await.unwrap();
        for i in 0..5 {
            log.append(TransactionLogEntry::new(
                &format!("tx-{i}"),
                LogOperation::Create,
                BundleState::Pending,
            ))
            .await
            .unwrap();
        }
        let ids: Vec<_> = log.entries().await.into_iter().map(|e| e.bundle_id).collect();
        assert_eq!(ids, ["tx-2", "tx-3", "tx-4"]);
    }

    #[tokio::test]
    async fn reload_restores_entries() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("state"));
        let log = TransactionLog::load(Arc::clone(&store), 10).await.unwrap();
        log.append(
            TransactionLogEntry::new("tx-1", LogOperation::Rollback, BundleState::Failed)
                .with_error("disk full"),
        )
        .await
        .unwrap();

        let reloaded = TransactionLog::load(store, 10).await.unwrap();
        let entries = reloaded.for_bundle("tx-1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, LogOperation::Rollback);
        assert_eq!(entries[0].error.as_deref(), Some("disk full"));
    }
}
