//! Durable delivery queue.
//!
//! Deliveries whose retry budget ran out land here instead of being lost.
//! The queue is persisted to the state store after every change, capped at
//! `queue_capacity` with the oldest entry evicted first, and keyed by
//! bundle id (re-queueing replaces the earlier frame).

use std::collections::VecDeque;
use std::sync::Arc;

use beam_types::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::store::{KeyValueStore, get_json, put_json};

/// State-store key of the persisted queue.
pub const DELIVERY_QUEUE_KEY: &str = "delivery_queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedDelivery {
    pub bundle_id: String,
    #[serde(with = "beam_types::encoding::b64")]
    pub frame: Vec<u8>,
    pub queued_at: i64,
    /// Times this entry has been demoted.
    pub demotions: u32,
    pub last_failure: String,
}

pub struct DeliveryQueue {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
    entries: VecDeque<QueuedDelivery>,
}

impl DeliveryQueue {
    pub async fn load(store: Arc<dyn KeyValueStore>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut entries: VecDeque<QueuedDelivery> =
            get_json::<Vec<QueuedDelivery>>(store.as_ref(), DELIVERY_QUEUE_KEY)
                .await?
                .unwrap_or_default()
                .into();
        while entries.len() > capacity {
            entries.pop_front();
        }
        Ok(Self {
            store,
            capacity,
            entries,
        })
    }

    /// Queue a frame. Returns the id evicted to make room, if any.
    pub async fn push(
        &mut self,
        bundle_id: &str,
        frame: Vec<u8>,
        failure: impl Into<String>,
    ) -> Result<Option<String>> {
        let demotions = match self.entries.iter().position(|e| e.bundle_id == bundle_id) {
            Some(idx) => self
                .entries
                .remove(idx)
                .map_or(1, |e| e.demotions.saturating_add(1)),
            None => 1,
        };
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|e| e.bundle_id)
        } else {
            None
        };
        self.entries.push_back(QueuedDelivery {
            bundle_id: bundle_id.to_string(),
            frame,
            queued_at: Utc::now().timestamp(),
            demotions,
            last_failure: failure.into(),
        });
        self.persist().await?;
        Ok(evicted)
    }

    pub async fn remove(&mut self, bundle_id: &str) -> Result<Option<QueuedDelivery>> {
        let Some(idx) = self.entries.iter().position(|e| e.bundle_id == bundle_id) else {
            return Ok(None);
        };
        let removed = self.entries.remove(idx);
        self.persist().await?;
        Ok(removed)
    }

    /// Oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<QueuedDelivery> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, bundle_id: &str) -> bool {
        self.entries.iter().any(|e| e.bundle_id == bundle_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn persist(&self) -> Result<()> {
        let snapshot: Vec<&QueuedDelivery> = self.entries.iter().collect();
        put_json(self.store.as_ref(), DELIVERY_QUEUE_KEY, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn queue(capacity: usize) -> (DeliveryQueue, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("state"));
        let q = DeliveryQueue::load(Arc::clone(&store), capacity).await.unwrap();
        (q, store)
    }

    #[tokio::test]
    async fn capped_oldest_evicted() {
        let (mut q, _) = queue(2).await;
        assert_eq!(q.push("tx-1", vec![1], "TIMEOUT").await.unwrap(), None);
        assert_eq!(q.push("tx-2", vec![2], "TIMEOUT").await.unwrap(), None);
        assert_eq!(
            q.push("tx-3", vec![3], "TIMEOUT").await.unwrap().as_deref(),
            Some("tx-1")
        );
        let ids: Vec<_> = q.entries().into_iter().map(|e| e.bundle_id).collect();
        assert_eq!(ids, ["tx-2", "tx-3"]);
    }

    #[tokio::test]
    async fn requeue_replaces_and_counts() {
        let (mut q, _) = queue(4).await;
        q.push("tx-1", vec![1], "TIMEOUT").await.unwrap();
        q.push("tx-2", vec![2], "TIMEOUT").await.unwrap();
        q.push("tx-1", vec![9], "NACK(STALE)").await.unwrap();
        let entries = q.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].bundle_id, "tx-1");
        assert_eq!(entries[1].frame, vec![9]);
        assert_eq!(entries[1].demotions, 2);
        assert_eq!(entries[1].last_failure, "NACK(STALE)");
    }

    #[tokio::test]
    async fn survives_reload() {
        let (mut q, store) = queue(4).await;
        q.push("tx-1", b"frame".to_vec(), "TIMEOUT").await.unwrap();
        q.push("tx-2", b"other".to_vec(), "TIMEOUT").await.unwrap();
        q.remove("tx-2").await.unwrap().unwrap();

        let reloaded = DeliveryQueue::load(store, 4).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains("tx-1"));
        assert_eq!(reloaded.entries()[0].frame, b"frame".to_vec());
    }
}
