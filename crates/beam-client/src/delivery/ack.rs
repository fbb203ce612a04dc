//! Acknowledgement state machine.
//!
//! Pure data: every method takes the current time in milliseconds, so the
//! whole retry schedule is testable without timers.
//!
//! ```text
//!            send
//!             │
//!             ▼        timeout / nack         deadline
//!     ┌──────────────┐  failures < max   ┌─────────┐
//!     │ AWAITING_ACK ├──────────────────▶│ BACKOFF ├──┐ resend
//!     └──┬────────┬──┘                   └─────────┘  │
//!    ack │        │ failures == max           ▲       │
//!        ▼        ▼                           └───────┘
//!    delivered  exhausted (demoted to the delivery queue)
//! ```

use std::collections::HashMap;
use std::fmt;

use beam_types::{BeamError, DeliveryConfig, Result};

use super::payload::NackReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    AwaitingAck,
    Backoff,
}

/// One in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub bundle_id: String,
    /// Encoded frame, resent unchanged.
    pub frame: Vec<u8>,
    pub sent_at_ms: u64,
    /// Retries performed so far.
    pub retry_count: u32,
    pub phase: AckPhase,
    /// Ack deadline while awaiting, resend time while backing off.
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFailure {
    Timeout,
    Nack(NackReason),
}

impl fmt::Display for AckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Nack(reason) => write!(f, "NACK({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    /// Failure within budget; resend at `resend_at_ms`.
    RetryScheduled {
        bundle_id: String,
        retry_count: u32,
        resend_at_ms: u64,
        cause: AckFailure,
    },
    /// Backoff elapsed; transmit `frame` again.
    Resend {
        bundle_id: String,
        frame: Vec<u8>,
        retry_count: u32,
    },
    /// Retry budget spent. The entry is no longer tracked.
    Exhausted {
        bundle_id: String,
        frame: Vec<u8>,
        cause: AckFailure,
    },
}

#[derive(Debug)]
pub struct AckTracker {
    config: DeliveryConfig,
    pending: HashMap<String, PendingAck>,
}

impl AckTracker {
    #[must_use]
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Start awaiting an ack for a frame sent at `now_ms`.
    ///
    /// # Errors
    /// `DeliveryAlreadyPending` if this id is already in flight.
    pub fn track(&mut self, bundle_id: &str, frame: Vec<u8>, now_ms: u64) -> Result<()> {
        if self.pending.contains_key(bundle_id) {
            return Err(BeamError::DeliveryAlreadyPending(bundle_id.to_string()));
        }
        self.pending.insert(
            bundle_id.to_string(),
            PendingAck {
                bundle_id: bundle_id.to_string(),
                frame,
                sent_at_ms: now_ms,
                retry_count: 0,
                phase: AckPhase::AwaitingAck,
                deadline_ms: now_ms.saturating_add(self.config.ack_timeout_ms),
            },
        );
        Ok(())
    }

    /// Resolve on ack. Returns `None` for ids not in flight, which are ignored.
    pub fn on_ack(&mut self, bundle_id: &str) -> Option<PendingAck> {
        self.pending.remove(bundle_id)
    }

    /// Handle a nack. `None` for ids not in flight.
    pub fn on_nack(
        &mut self,
        bundle_id: &str,
        reason: NackReason,
        now_ms: u64,
    ) -> Option<AckEvent> {
        if !self.pending.contains_key(bundle_id) {
            return None;
        }
        Some(self.fail(bundle_id, AckFailure::Nack(reason), now_ms))
    }

    /// Stop tracking without an outcome.
    pub fn cancel(&mut self, bundle_id: &str) -> Option<PendingAck> {
        self.pending.remove(bundle_id)
    }

    /// Fire every deadline at or before `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> Vec<AckEvent> {
        let mut due: Vec<(String, AckPhase, u64)> = self
            .pending
            .values()
            .filter(|p| p.deadline_ms <= now_ms)
            .map(|p| (p.bundle_id.clone(), p.phase, p.deadline_ms))
            .collect();
        due.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let mut events = Vec::with_capacity(due.len());
        for (bundle_id, phase, _) in due {
            match phase {
                AckPhase::AwaitingAck => {
                    events.push(self.fail(&bundle_id, AckFailure::Timeout, now_ms));
                }
                AckPhase::Backoff => {
                    let timeout = self.config.ack_timeout_ms;
                    if let Some(entry) = self.pending.get_mut(&bundle_id) {
                        entry.phase = AckPhase::AwaitingAck;
                        entry.sent_at_ms = now_ms;
                        entry.deadline_ms = now_ms.saturating_add(timeout);
                        events.push(AckEvent::Resend {
                            bundle_id,
                            frame: entry.frame.clone(),
                            retry_count: entry.retry_count,
                        });
                    }
                }
            }
        }
        events
    }

    fn fail(&mut self, bundle_id: &str, cause: AckFailure, now_ms: u64) -> AckEvent {
        let max_retries = self.config.max_retries;
        let retry_count = self.pending.get(bundle_id).map_or(max_retries, |p| p.retry_count);

        // This failure is number `retry_count + 1` in a row.
        if retry_count.saturating_add(1) < max_retries {
            let backoff = self.config.backoff_ms(retry_count);
            if let Some(entry) = self.pending.get_mut(bundle_id) {
                entry.retry_count += 1;
                entry.phase = AckPhase::Backoff;
                entry.deadline_ms = now_ms.saturating_add(backoff);
                return AckEvent::RetryScheduled {
                    bundle_id: bundle_id.to_string(),
                    retry_count: entry.retry_count,
                    resend_at_ms: entry.deadline_ms,
                    cause,
                };
            }
        }

        let frame = self
            .pending
            .remove(bundle_id)
            .map(|p| p.frame)
            .unwrap_or_default();
        AckEvent::Exhausted {
            bundle_id: bundle_id.to_string(),
            frame,
            cause,
        }
    }

    #[must_use]
    pub fn pending(&self, bundle_id: &str) -> Option<&PendingAck> {
        self.pending.get(bundle_id)
    }

    /// Earliest deadline across all in-flight deliveries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().map(|p| p.deadline_ms).min()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
