//! Background attestation retry schedule.
//!
//! When an attestation fetch fails the bundle is still stored; a retry is
//! queued here instead. The queue is plain data (attempt counts and due
//! times) so the schedule can be tested without timers:
//!
//! ```text
//! delay(attempts) = min(base × 2^attempts, max_delay)
//! abandoned once now - first_enqueued_at ≥ abandon_after
//! ```

use std::collections::VecDeque;

use beam_types::{AttestationRetryConfig, AttestationRole};
use serde::{Deserialize, Serialize};

/// State-store key holding the serialized queue.
pub const QUEUE_KEY: &str = "attestation_queue";

/// Doubling stops here; `2^30` seconds is far past any cap.
const MAX_BACKOFF_SHIFT: u32 = 30;

/// One pending attestation fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRetry {
    pub bundle_id: String,
    pub role: AttestationRole,
    /// Failed fetches so far.
    pub attempts: u32,
    pub first_enqueued_at: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

/// What happened to an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled { next_attempt_at: i64 },
    Abandoned,
    /// Entry was no longer queued.
    Untracked,
}

#[derive(Debug, Clone)]
pub struct AttestationRetryQueue {
    config: AttestationRetryConfig,
    entries: VecDeque<AttestationRetry>,
}

impl AttestationRetryQueue {
    #[must_use]
    pub fn new(config: AttestationRetryConfig) -> Self {
        Self::from_entries(config, Vec::new())
    }

    /// Rebuild from persisted entries, keeping the newest `capacity`.
    #[must_use]
    pub fn from_entries(config: AttestationRetryConfig, entries: Vec<AttestationRetry>) -> Self {
        let mut entries: VecDeque<_> = entries.into();
        while entries.len() > config.capacity.max(1) {
            entries.pop_front();
        }
        Self { config, entries }
    }

    /// Delay before the next attempt after `attempts` failures. Never
    /// negative, never above `max_delay_secs`.
    #[must_use]
    pub fn delay_secs(&self, attempts: u32) -> i64 {
        let factor = 1i64 << attempts.min(MAX_BACKOFF_SHIFT);
        self.config
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.config.max_delay_secs)
    }

    /// Queue a retry after the initial failed fetch. Re-enqueueing a
    /// queued (bundle, role) pair is a no-op. Returns the evicted entry if
    /// the queue was full.
    pub fn enqueue(
        &mut self,
        bundle_id: &str,
        role: AttestationRole,
        now: i64,
        error: Option<String>,
    ) -> Option<AttestationRetry> {
        if self.position(bundle_id, role).is_some() {
            return None;
        }
        let evicted = if self.entries.len() >= self.config.capacity.max(1) {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(AttestationRetry {
            bundle_id: bundle_id.to_string(),
            role,
            attempts: 1,
            first_enqueued_at: now,
            next_attempt_at: now.saturating_add(self.delay_secs(0)),
            last_error: error,
        });
        evicted
    }

    /// Entries whose next attempt is due.
    #[must_use]
    pub fn due(&self, now: i64) -> Vec<AttestationRetry> {
        self.entries
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect()
    }

    /// Whether the abandonment window has passed for this entry.
    #[must_use]
    pub fn is_expired(&self, entry: &AttestationRetry, now: i64) -> bool {
        now.saturating_sub(entry.first_enqueued_at) >= self.config.abandon_after_secs
    }

    /// Record another failed attempt.
    pub fn record_failure(
        &mut self,
        bundle_id: &str,
        role: AttestationRole,
        now: i64,
        error: String,
    ) -> RetryOutcome {
        let Some(idx) = self.position(bundle_id, role) else {
            return RetryOutcome::Untracked;
        };
        let delay = self.delay_secs(self.entries[idx].attempts);
        let expired = self.is_expired(&self.entries[idx], now);
        if expired {
            self.entries.remove(idx);
            return RetryOutcome::Abandoned;
        }
        let entry = &mut self.entries[idx];
        entry.attempts = entry.attempts.saturating_add(1);
        entry.next_attempt_at = now.saturating_add(delay);
        entry.last_error = Some(error);
        RetryOutcome::Rescheduled {
            next_attempt_at: entry.next_attempt_at,
        }
    }

    pub fn remove(&mut self, bundle_id: &str, role: AttestationRole) -> Option<AttestationRetry> {
        let idx = self.position(bundle_id, role)?;
        self.entries.remove(idx)
    }

    /// Drop every entry for a bundle.
    pub fn remove_bundle(&mut self, bundle_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.bundle_id != bundle_id);
        before - self.entries.len()
    }

    /// Earliest due time, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.next_attempt_at).min()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<AttestationRetry> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, bundle_id: &str, role: AttestationRole) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.bundle_id == bundle_id && e.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AttestationRetryConfig {
        AttestationRetryConfig {
            base_delay_secs: 30,
            max_delay_secs: 300,
            abandon_after_secs: 86_400,
            capacity: 3,
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let q = AttestationRetryQueue::new(config());
        let delays: Vec<_> = (0..6).map(|a| q.delay_secs(a)).collect();
        assert_eq!(delays, [30, 60, 120, 240, 300, 300]);
        assert_eq!(q.delay_secs(200), 300);
        for attempts in [31, 62, 63, 64, u32::MAX] {
            assert_eq!(q.delay_secs(attempts), 300, "attempts = {attempts}");
        }
    }

    #[test]
    fn enqueue_schedules_first_retry() {
        let mut q = AttestationRetryQueue::new(config());
        q.enqueue("tx-1", AttestationRole::Payer, 1_000, Some("offline".into()));
        assert!(q.due(1_029).is_empty());
        assert_eq!(q.due(1_030).len(), 1);
        assert_eq!(q.next_due(), Some(1_030));
    }

    #[test]
    fn duplicate_enqueue_ignored() {
        let mut q = AttestationRetryQueue::new(config());
        q.enqueue("tx-1", AttestationRole::Payer, 0, None);
        q.enqueue("tx-1", AttestationRole::Payer, 5, None);
        q.enqueue("tx-1", AttestationRole::Merchant, 5, None);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut q = AttestationRetryQueue::new(config());
        for i in 0..3 {
            assert!(q.enqueue(&format!("tx-{i}"), AttestationRole::Payer, i, None).is_none());
        }
        let evicted = q.enqueue("tx-3", AttestationRole::Payer, 3, None).unwrap();
        assert_eq!(evicted.bundle_id, "tx-0");
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn failures_back_off() {
        let mut q = AttestationRetryQueue::new(config());
        q.enqueue("tx-1", AttestationRole::Payer, 0, None);
        let outcome = q.record_failure("tx-1", AttestationRole::Payer, 30, "still down".into());
        assert_eq!(outcome, RetryOutcome::Rescheduled { next_attempt_at: 90 });
        let outcome = q.record_failure("tx-1", AttestationRole::Payer, 90, "still down".into());
        assert_eq!(outcome, RetryOutcome::Rescheduled { next_attempt_at: 210 });
        assert_eq!(q.entries()[0].attempts, 3);
    }

    #[test]
    fn abandoned_after_window() {
        let mut q = AttestationRetryQueue::new(config());
        q.enqueue("tx-1", AttestationRole::Payer, 0, None);
        let entry = q.entries()[0].clone();
        assert!(!q.is_expired(&entry, 86_399));
        assert!(q.is_expired(&entry, 86_400));
        let outcome = q.record_failure("tx-1", AttestationRole::Payer, 86_400, "down".into());
        assert_eq!(outcome, RetryOutcome::Abandoned);
        assert!(q.is_empty());
        assert_eq!(
            q.record_failure("tx-1", AttestationRole::Payer, 86_401, "down".into()),
            RetryOutcome::Untracked
        );
    }

    #[test]
    fn remove_bundle_drops_all_roles() {
        let mut q = AttestationRetryQueue::new(config());
        q.enqueue("tx-1", AttestationRole::Payer, 0, None);
        q.enqueue("tx-1", AttestationRole::Merchant, 0, None);
        q.enqueue("tx-2", AttestationRole::Payer, 0, None);
        assert_eq!(q.remove_bundle("tx-1"), 2);
        assert!(q.remove("tx-2", AttestationRole::Payer).is_some());
        assert!(q.is_empty());
    }
}
