//! Delivery service: drives the [`AckTracker`] against a [`PeerChannel`]
//! and a durable [`DeliveryQueue`], publishing [`DeliveryEvent`]s.
//!
//! Every time-dependent method has an `_at(now_ms)` form taking
//! milliseconds since the service was created; the plain form reads the
//! clock. [`DeliveryService::run`] is the event loop for a device process.

use std::sync::Arc;
use std::time::Duration;

use beam_types::{DeliveryConfig, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::ack::{AckEvent, AckFailure, AckTracker, PendingAck};
use super::channel::PeerChannel;
use super::payload::{DeliveryFrame, DeliveryPayload, NackReason, decode_frame, encode_frame};
use super::queue::DeliveryQueue;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered {
        bundle_id: String,
        retries: u32,
    },
    Nacked {
        bundle_id: String,
        reason: NackReason,
        /// Retry budget spent; the delivery was queued.
        terminal: bool,
    },
    TimedOut {
        bundle_id: String,
        retry_count: u32,
        terminal: bool,
    },
    Queued {
        bundle_id: String,
        evicted: Option<String>,
    },
    Flushed {
        resent: usize,
        remaining: usize,
    },
    /// A bundle frame arrived from the peer.
    Received(DeliveryPayload),
}

pub struct DeliveryService {
    config: DeliveryConfig,
    channel: Arc<dyn PeerChannel>,
    tracker: AckTracker,
    queue: DeliveryQueue,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    epoch: Instant,
}

impl DeliveryService {
    /// Create the service, loading the durable queue from `state`.
    pub async fn new(
        config: DeliveryConfig,
        channel: Arc<dyn PeerChannel>,
        state: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveryEvent>)> {
        let queue = DeliveryQueue::load(state, config.queue_capacity).await?;
        let (events, rx) = mpsc::unbounded_channel();
        tracing::info!(queued = queue.len(), "Delivery service started");
        Ok((
            Self {
                tracker: AckTracker::new(config.clone()),
                config,
                channel,
                queue,
                events,
                epoch: Instant::now(),
            },
            rx,
        ))
    }

    /// Milliseconds since the service was created.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    // -----------------------------------------------------------------
    // Sending side
    // -----------------------------------------------------------------

    pub async fn send(&mut self, payload: &DeliveryPayload) -> Result<()> {
        let now = self.now_ms();
        self.send_at(payload, now).await
    }

    /// Send a bundle and start its ack timer.
    ///
    /// # Errors
    /// - `PayloadTooLarge` if the frame exceeds the transport ceiling
    /// - `DeliveryAlreadyPending` if this bundle is already in flight
    ///
    /// A transport failure is not an error here: the ack timer covers it.
    pub async fn send_at(&mut self, payload: &DeliveryPayload, now_ms: u64) -> Result<()> {
        let frame = encode_frame(
            &DeliveryFrame::Bundle(payload.clone()),
            self.config.max_payload_bytes,
        )?;
        let bundle_id = payload.bundle_id();
        self.tracker.track(bundle_id, frame.clone(), now_ms)?;
        tracing::debug!(bundle_id = %bundle_id, bytes = frame.len(), "Sending bundle");
        self.transmit(bundle_id, frame).await;
        Ok(())
    }

    async fn transmit(&self, bundle_id: &str, frame: Vec<u8>) -> bool {
        match self.channel.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(bundle_id = %bundle_id, error = %e, "Transmit failed");
                false
            }
        }
    }

    pub async fn tick(&mut self) -> Result<()> {
        let now = self.now_ms();
        self.tick_at(now).await
    }

    /// Fire due ack deadlines and backoff timers.
    pub async fn tick_at(&mut self, now_ms: u64) -> Result<()> {
        for event in self.tracker.poll(now_ms) {
            self.apply(event).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, event: AckEvent) -> Result<()> {
        match event {
            AckEvent::RetryScheduled {
                bundle_id,
                retry_count,
                resend_at_ms,
                cause,
            } => {
                tracing::warn!(
                    bundle_id = %bundle_id,
                    retry_count,
                    resend_at_ms,
                    cause = %cause,
                    "Delivery not acknowledged, retrying"
                );
                self.emit(failure_event(bundle_id, retry_count, cause, false));
            }
            AckEvent::Resend {
                bundle_id,
                frame,
                retry_count,
            } => {
                tracing::debug!(bundle_id = %bundle_id, retry_count, "Resending bundle");
                self.transmit(&bundle_id, frame).await;
            }
            AckEvent::Exhausted {
                bundle_id,
                frame,
                cause,
            } => {
                let evicted = self
                    .queue
                    .push(&bundle_id, frame, cause.to_string())
                    .await?;
                tracing::warn!(
                    bundle_id = %bundle_id,
                    cause = %cause,
                    evicted = ?evicted,
                    "Delivery retries exhausted, moved to delivery queue"
                );
                let retry_count = self.config.max_retries;
                self.emit(failure_event(bundle_id.clone(), retry_count, cause, true));
                self.emit(DeliveryEvent::Queued { bundle_id, evicted });
            }
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<usize> {
        let now = self.now_ms();
        self.flush_at(now).await
    }

    /// Resend queued deliveries, oldest first. Stops at the first transport
    /// failure; entries stay queued until the channel accepts them.
    pub async fn flush_at(&mut self, now_ms: u64) -> Result<usize> {
        let mut resent = 0;
        for entry in self.queue.entries() {
            if self.tracker.pending(&entry.bundle_id).is_some() {
                continue;
            }
            if let Err(e) = self.channel.send(entry.frame.clone()).await {
                tracing::debug!(error = %e, remaining = self.queue.len(), "Flush stopped");
                break;
            }
            self.tracker.track(&entry.bundle_id, entry.frame, now_ms)?;
            self.queue.remove(&entry.bundle_id).await?;
            resent += 1;
        }
        if resent > 0 {
            tracing::info!(resent, remaining = self.queue.len(), "Delivery queue flushed");
            self.emit(DeliveryEvent::Flushed {
                resent,
                remaining: self.queue.len(),
            });
        }
        Ok(resent)
    }

    // -----------------------------------------------------------------
    // Receiving side
    // -----------------------------------------------------------------

    pub async fn handle_incoming(&mut self, bytes: &[u8]) -> Result<Option<DeliveryPayload>> {
        let now = self.now_ms();
        self.handle_incoming_at(bytes, now).await
    }

    /// Process one inbound frame. Returns the payload of a bundle frame;
    /// the caller decides whether to [`acknowledge`](Self::acknowledge) or
    /// [`reject`](Self::reject) it.
    pub async fn handle_incoming_at(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<Option<DeliveryPayload>> {
        match decode_frame(bytes, self.config.max_payload_bytes)? {
            DeliveryFrame::Ack { bundle_id } => {
                match self.tracker.on_ack(&bundle_id) {
                    Some(resolved) => {
                        tracing::info!(
                            bundle_id = %bundle_id,
                            retries = resolved.retry_count,
                            "Delivery acknowledged"
                        );
                        self.emit(DeliveryEvent::Delivered {
                            bundle_id,
                            retries: resolved.retry_count,
                        });
                    }
                    None => {
                        tracing::debug!(bundle_id = %bundle_id, "Ack for untracked bundle ignored");
                    }
                }
                Ok(None)
            }
            DeliveryFrame::Nack { bundle_id, reason } => {
                match self.tracker.on_nack(&bundle_id, reason, now_ms) {
                    Some(event) => self.apply(event).await?,
                    None => {
                        tracing::debug!(
                            bundle_id = %bundle_id,
                            "Nack for untracked bundle ignored"
                        );
                    }
                }
                Ok(None)
            }
            DeliveryFrame::Bundle(payload) => {
                tracing::debug!(bundle_id = %payload.bundle_id(), "Bundle frame received");
                self.emit(DeliveryEvent::Received(payload.clone()));
                Ok(Some(payload))
            }
        }
    }

    pub async fn acknowledge(&self, bundle_id: &str) -> Result<()> {
        let frame = encode_frame(
            &DeliveryFrame::Ack {
                bundle_id: bundle_id.to_string(),
            },
            self.config.max_payload_bytes,
        )?;
        self.channel.send(frame).await
    }

    pub async fn reject(&self, bundle_id: &str, reason: NackReason) -> Result<()> {
        let frame = encode_frame(
            &DeliveryFrame::Nack {
                bundle_id: bundle_id.to_string(),
                reason,
            },
            self.config.max_payload_bytes,
        )?;
        self.channel.send(frame).await
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    #[must_use]
    pub fn pending(&self, bundle_id: &str) -> Option<&PendingAck> {
        self.tracker.pending(bundle_id)
    }

    #[must_use]
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    fn emit(&self, event: DeliveryEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------

    /// Process inbound frames and timers until `shutdown` changes or the
    /// inbound channel closes. The flush timer is armed only while the
    /// durable queue holds entries.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let flush_every = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let mut next_flush = Instant::now() + flush_every;

        loop {
            let ack_deadline = self
                .tracker
                .next_deadline()
                .map(|ms| self.epoch + Duration::from_millis(ms));
            let flush_armed = !self.queue.is_empty();
            if !flush_armed {
                next_flush = Instant::now() + flush_every;
            }

            tokio::select! {
                frame = inbound.recv() => {
                    let Some(bytes) = frame else { break };
                    if let Err(e) = self.handle_incoming(&bytes).await {
                        tracing::warn!(error = %e, "Dropped inbound frame");
                    }
                }
                () = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Delivery tick failed");
                    }
                }
                () = tokio::time::sleep_until(next_flush), if flush_armed => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "Delivery flush failed");
                    }
                    next_flush = Instant::now() + flush_every;
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(in_flight = self.tracker.len(), "Delivery service stopped");
    }
}

fn failure_event(
    bundle_id: String,
    retry_count: u32,
    cause: AckFailure,
    terminal: bool,
) -> DeliveryEvent {
    match cause {
        AckFailure::Timeout => DeliveryEvent::TimedOut {
            bundle_id,
            retry_count,
            terminal,
        },
        AckFailure::Nack(reason) => DeliveryEvent::Nacked {
            bundle_id,
            reason,
            terminal,
        },
    }
}

#[cfg(test)]
mod tests {
    use beam_types::OfflineBundle;

    use super::*;
    use crate::delivery::channel::MpscChannel;
    use crate::store::MemoryStore;

    struct Rig {
        service: DeliveryService,
        events: mpsc::UnboundedReceiver<DeliveryEvent>,
        link: MpscChannel,
        peer: mpsc::Receiver<Vec<u8>>,
        state: Arc<dyn KeyValueStore>,
    }

    async fn rig(config: DeliveryConfig) -> Rig {
        let (link, peer) = MpscChannel::pair(16);
        let state: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("state"));
        let (service, events) =
            DeliveryService::new(config, Arc::new(link.clone()), Arc::clone(&state))
                .await
                .unwrap();
        Rig {
            service,
            events,
            link,
            peer,
            state,
        }
    }

    fn payload(id: &str) -> DeliveryPayload {
        let (mut bundle, payer, _) = OfflineBundle::dummy(id, 1_000, 1);
        bundle.sign_as_payer(&payer).unwrap();
        DeliveryPayload::new(bundle)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn frames(peer: &mut mpsc::Receiver<Vec<u8>>) -> Vec<DeliveryFrame> {
        let mut out = Vec::new();
        while let Ok(bytes) = peer.try_recv() {
            out.push(decode_frame(&bytes, usize::MAX).unwrap());
        }
        out
    }

    fn ack(id: &str) -> Vec<u8> {
        encode_frame(
            &DeliveryFrame::Ack {
                bundle_id: id.into(),
            },
            usize::MAX,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ack_completes_delivery() {
        let mut r = rig(DeliveryConfig::default()).await;
        r.service.send_at(&payload("tx-1"), 0).await.unwrap();
        let sent = frames(&mut r.peer);
        assert!(matches!(&sent[..], [DeliveryFrame::Bundle(p)] if p.bundle_id() == "tx-1"));

        r.service.handle_incoming_at(&ack("tx-1"), 100).await.unwrap();
        assert!(r.service.pending("tx-1").is_none());
        assert_eq!(
            drain(&mut r.events),
            [DeliveryEvent::Delivered {
                bundle_id: "tx-1".into(),
                retries: 0
            }]
        );

        // A second ack for the same id is ignored.
        r.service.handle_incoming_at(&ack("tx-1"), 200).await.unwrap();
        assert!(drain(&mut r.events).is_empty());
    }

    #[tokio::test]
    async fn third_consecutive_timeout_moves_to_queue() {
        let mut r = rig(DeliveryConfig::default()).await;
        r.service.send_at(&payload("tx-lost"), 0).await.unwrap();

        // Three sends, each left unanswered.
        for now in [5_000, 6_000, 11_000, 13_000, 18_000] {
            r.service.tick_at(now).await.unwrap();
        }

        assert!(r.service.pending("tx-lost").is_none());
        assert!(r.service.queue().contains("tx-lost"));
        assert_eq!(frames(&mut r.peer).len(), 3);

        let events = drain(&mut r.events);
        let timeouts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeliveryEvent::TimedOut {
                    retry_count,
                    terminal,
                    ..
                } => Some((*retry_count, *terminal)),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, [(1, false), (2, false), (3, true)]);
        assert_eq!(
            events.last(),
            Some(&DeliveryEvent::Queued {
                bundle_id: "tx-lost".into(),
                evicted: None
            })
        );

        // The queue is durable.
        let reloaded = DeliveryQueue::load(r.state, 64).await.unwrap();
        assert!(reloaded.contains("tx-lost"));
    }

    #[tokio::test]
    async fn nack_retries_then_queues() {
        let mut r = rig(DeliveryConfig {
            max_retries: 2,
            ..DeliveryConfig::default()
        })
        .await;
        r.service.send_at(&payload("tx-n"), 0).await.unwrap();
        let nack = encode_frame(
            &DeliveryFrame::Nack {
                bundle_id: "tx-n".into(),
                reason: NackReason::Stale,
            },
            usize::MAX,
        )
        .unwrap();

        r.service.handle_incoming_at(&nack, 10).await.unwrap();
        r.service.tick_at(1_010).await.unwrap();
        r.service.handle_incoming_at(&nack, 1_020).await.unwrap();

        let events = drain(&mut r.events);
        assert_eq!(
            events,
            [
                DeliveryEvent::Nacked {
                    bundle_id: "tx-n".into(),
                    reason: NackReason::Stale,
                    terminal: false
                },
                DeliveryEvent::Nacked {
                    bundle_id: "tx-n".into(),
                    reason: NackReason::Stale,
                    terminal: true
                },
                DeliveryEvent::Queued {
                    bundle_id: "tx-n".into(),
                    evicted: None
                },
            ]
        );
        assert_eq!(r.service.queue().entries()[0].last_failure, "NACK(STALE)");
    }

    #[tokio::test]
    async fn flush_waits_for_link() {
        let mut r = rig(DeliveryConfig {
            max_retries: 1,
            ..DeliveryConfig::default()
        })
        .await;
        r.service.send_at(&payload("tx-f"), 0).await.unwrap();
        r.service.tick_at(5_000).await.unwrap();
        assert!(r.service.queue().contains("tx-f"));
        frames(&mut r.peer);

        r.link.set_connected(false);
        assert_eq!(r.service.flush_at(6_000).await.unwrap(), 0);
        assert!(r.service.queue().contains("tx-f"));

        r.link.set_connected(true);
        assert_eq!(r.service.flush_at(7_000).await.unwrap(), 1);
        assert!(r.service.queue().is_empty());
        assert_eq!(r.service.pending("tx-f").unwrap().sent_at_ms, 7_000);
        assert_eq!(frames(&mut r.peer).len(), 1);
        assert!(drain(&mut r.events).contains(&DeliveryEvent::Flushed {
            resent: 1,
            remaining: 0
        }));
    }

    #[tokio::test]
    async fn duplicate_send_refused() {
        let mut r = rig(DeliveryConfig::default()).await;
        r.service.send_at(&payload("tx-d"), 0).await.unwrap();
        let err = r.service.send_at(&payload("tx-d"), 1).await.unwrap_err();
        assert!(matches!(err, beam_types::BeamError::DeliveryAlreadyPending(_)));
    }

    #[tokio::test]
    async fn inbound_bundle_surfaces_payload() {
        let mut r = rig(DeliveryConfig::default()).await;
        let bytes = encode_frame(&DeliveryFrame::Bundle(payload("tx-in")), usize::MAX).unwrap();
        let received = r.service.handle_incoming_at(&bytes, 0).await.unwrap().unwrap();
        assert_eq!(received.bundle_id(), "tx-in");
        assert!(matches!(
            &drain(&mut r.events)[..],
            [DeliveryEvent::Received(p)] if p.bundle_id() == "tx-in"
        ));

        r.service.acknowledge("tx-in").await.unwrap();
        assert_eq!(
            frames(&mut r.peer),
            [DeliveryFrame::Ack {
                bundle_id: "tx-in".into()
            }]
        );
    }

    #[tokio::test]
    async fn run_loop_delivers_and_stops() {
        let config = DeliveryConfig {
            ack_timeout_ms: 50,
            backoff_base_ms: 10,
            backoff_cap_ms: 20,
            ..DeliveryConfig::default()
        };
        let mut r = rig(config).await;
        r.service.send(&payload("tx-run")).await.unwrap();

        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.service.run(inbound_rx, stop_rx));

        // Peer sees the bundle (possibly resent), then acks it.
        let first = r.peer.recv().await.unwrap();
        assert!(matches!(
            decode_frame(&first, usize::MAX).unwrap(),
            DeliveryFrame::Bundle(_)
        ));
        inbound_tx.send(ack("tx-run")).await.unwrap();

        let delivered = loop {
            match r.events.recv().await.unwrap() {
                DeliveryEvent::Delivered { bundle_id, .. } => break bundle_id,
                DeliveryEvent::TimedOut { terminal: false, .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(delivered, "tx-run");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
