//! Peer channel seam.
//!
//! The radio transport itself lives outside this crate; the delivery layer
//! only needs "send these bytes to the peer, or tell me you can't".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use beam_types::{BeamError, Result};
use tokio::sync::mpsc;

#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Hand one encoded frame to the transport. Delivery is not guaranteed
    /// even on `Ok`.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;
}

/// In-process channel backed by a bounded `mpsc`. The far end reads frames
/// from the receiver returned by [`MpscChannel::pair`].
#[derive(Debug, Clone)]
pub struct MpscChannel {
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl MpscChannel {
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                connected: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Simulate the link going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerChannel for MpscChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(BeamError::PeerUnavailable {
                reason: "link down".into(),
            });
        }
        self.tx.send(frame).await.map_err(|_| BeamError::PeerUnavailable {
            reason: "peer closed".into(),
        })
    }
}
