//! Inbound queue shared by the in-process transports.

use courier_types::Envelope;
use tokio::sync::{mpsc, Mutex};

/// Unbounded envelope queue that can be closed and reopened across
/// connect cycles.
///
/// Closing drops the queue's own sender; once every clone handed out by
/// [`InboundQueue::sender`] is gone too, a pending [`InboundQueue::next`]
/// returns `None`.
#[derive(Debug)]
pub struct InboundQueue {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            tx: std::sync::Mutex::new(None),
            rx: Mutex::new(None),
        }
    }

    /// Start a fresh channel, discarding anything left from a previous cycle.
    pub async fn open(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.rx.lock().await = Some(rx);
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// A sender for background tasks. `None` when closed.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<Envelope>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Queue an envelope. Returns `false` if the queue is closed.
    pub fn push(&self, envelope: Envelope) -> bool {
        match self.sender() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Wait for the next envelope. Cancel-safe.
    pub async fn next(&self) -> Option<Envelope> {
        let mut rx = self.rx.lock().await;
        match rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
