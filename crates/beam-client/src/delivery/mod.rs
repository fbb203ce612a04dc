//! # Delivery acknowledgement protocol
//!
//! At-least-once bundle delivery over an unreliable point-to-point link.
//!
//! | Module | Role |
//! |--------|------|
//! | [`payload`] | wire frames (`Bundle`, `Ack`, `Nack`) and size ceiling |
//! | [`ack`] | pure per-bundle ack/backoff state machine |
//! | [`queue`] | durable, capped queue for deliveries that ran out of retries |
//! | [`channel`] | transport seam |
//! | [`service`] | ties the above together and publishes events |

pub mod ack;
pub mod channel;
pub mod payload;
pub mod queue;
pub mod service;

pub use ack::{AckEvent, AckFailure, AckPhase, AckTracker, PendingAck};
pub use channel::{MpscChannel, PeerChannel};
pub use payload::{DeliveryFrame, DeliveryPayload, NackReason, decode_frame, encode_frame};
pub use queue::{DeliveryQueue, QueuedDelivery};
pub use service::{DeliveryEvent, DeliveryService};
